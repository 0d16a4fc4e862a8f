use anyhow::{Context, Result};
use clap::Parser;
use gptpd::clock::{PlatformClock, SystemClock};
use gptpd::config::GptpConfig;
use gptpd::net::{self, RawEthernetLink};
use gptpd::port::PortLink;
use gptpd::ptp::Event;
use gptpd::timestamper::SoftwareTimestamper;
use gptpd::PtpClock;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Interface name to bind to (auto-detected if not provided)
    #[arg(short, long)]
    interface: Option<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the clock's priority1
    #[arg(long)]
    priority1: Option<u8>,

    /// Never become master on this port
    #[arg(long)]
    force_slave: bool,

    /// Discipline the system clock to the grandmaster
    #[arg(long)]
    syntonize: bool,

    /// Write a JSON status snapshot to this file
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Seconds between status reports
    #[arg(long, default_value_t = 10)]
    status_interval: u64,
}

fn load_config(args: &Args) -> Result<GptpConfig> {
    let mut config = match &args.config {
        Some(path) => GptpConfig::load(path)?,
        None => GptpConfig::default(),
    };
    if let Some(p1) = args.priority1 {
        config.clock.priority1 = p1;
    }
    if args.force_slave {
        config.port.force_slave = true;
    }
    if args.syntonize {
        config.clock.syntonize = true;
    }
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();
    let config = load_config(&args)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    // 1. System clock, only touched when syntonizing
    let system_clock: Option<Box<dyn SystemClock>> = if config.clock.syntonize {
        match PlatformClock::new() {
            Ok(c) => {
                info!("System clock control initialized.");
                Some(Box::new(c))
            }
            Err(e) => {
                error!("Failed to initialize system clock adjustment: {}", e);
                return Err(e);
            }
        }
    } else {
        None
    };

    // 2. Network interface
    let iface = match &args.interface {
        Some(name) => name.clone(),
        None => net::default_interface()?,
    };
    let timestamper = Arc::new(SoftwareTimestamper::new());
    let link = RawEthernetLink::open(&iface, timestamper.clone())
        .with_context(|| format!("Failed to open {}", iface))?;

    // 3. Clock and port
    let clock = PtpClock::new(&config, system_clock)?;
    let handle = clock.add_port(&config.port, PortLink::new(Arc::new(link), timestamper));
    info!(
        "gPTP clock {} on {} (priority1 {}{})",
        clock.clock_identity(),
        iface,
        config.clock.priority1,
        if config.port.force_slave { ", slave only" } else { "" }
    );
    clock.process_event(handle, Event::PowerUp);

    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        warn!("Failed to notify systemd: {}", e);
    }

    // 4. Main loop: status reporting
    let status_interval = Duration::from_secs(args.status_interval.max(1));
    let mut last_status = Instant::now();
    while running.load(Ordering::SeqCst) && clock.is_running() {
        thread::sleep(Duration::from_millis(100));
        if last_status.elapsed() < status_interval {
            continue;
        }
        last_status = Instant::now();

        let status = clock.status();
        let (as_capable, link_delay) = clock
            .with_port(handle, |p| (p.as_capable(), p.one_way_delay_ns()))
            .unwrap_or((false, 0));
        info!(
            "[Status] {} GM {} | Offset {}ns | Freq {:+.3}ppm | AsCapable {} | Delay {}ns | Sync {} PDelay {}",
            status.port_state.as_deref().unwrap_or("-"),
            status.gm_identity.as_deref().unwrap_or("-"),
            status.offset_ns,
            status.freq_adj_ppm,
            as_capable,
            link_delay,
            status.sync_count,
            status.pdelay_count
        );
        if let Some(path) = &args.status_file {
            if let Err(e) = status.save(path) {
                warn!("{:#}", e);
            }
        }
    }

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    clock.shutdown();
    info!("Stopped.");
    Ok(())
}
