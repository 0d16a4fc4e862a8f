//! Cross-port best master selection.

use crate::message::Announce;
use crate::ptp::{PortState, SLAVE_ONLY_PRIORITY1};
use crate::ptp_clock::{lock, PtpClock};
use crate::traits::PortContext;
use log::{debug, info};
use std::sync::PoisonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BmcaOutcome {
    /// The selected grandmaster differs from the previous run.
    pub changed_master: bool,
    /// This clock beats EBest and is grandmaster.
    pub local_wins: bool,
}

impl PtpClock {
    /// Run BMCA over every enabled port and push the resulting
    /// recommendations. Returns `None` when no port holds a qualified
    /// Announce or the clock is slave-only; nothing changes in that case.
    pub fn run_bmca(&self) -> Option<BmcaOutcome> {
        if self.clock_config().priority1 == SLAVE_ONLY_PRIORITY1 {
            debug!("BMCA: slave-only clock, skipping");
            return None;
        }
        let mut bmca = lock(&self.bmca);

        let slots: Vec<_> = self
            .ports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .cloned()
            .collect();
        let mut ports: Vec<_> = slots.iter().map(|slot| lock(&slot.port)).collect();

        let mut ebest: Option<(usize, Announce)> = None;
        for (idx, port) in ports.iter_mut().enumerate() {
            if !port.state().is_enabled() {
                continue;
            }
            if let Some(er_best) = port.calculate_er_best() {
                let better = match &ebest {
                    None => true,
                    Some((_, current)) => er_best.is_better_than(current),
                };
                if better {
                    ebest = Some((idx, er_best.clone()));
                }
            }
        }

        let Some((ebest_port, ebest)) = ebest else {
            debug!("BMCA: no qualified Announce on any port");
            return None;
        };

        let local_wins = self.is_better_than(&ebest.dataset);
        let selected = if local_wins {
            self.local_dataset()
        } else {
            ebest.dataset.clone()
        };

        let gm = selected.grandmaster_identity;
        let changed_master = bmca.last_ebest_identity != Some(gm);
        if changed_master {
            info!(
                "BMCA: grandmaster {} (priority1 {}){}",
                gm,
                selected.priority1,
                if local_wins {
                    " is this clock".to_string()
                } else {
                    format!(" via {}", ebest.header.source)
                }
            );
        }
        bmca.last_ebest_identity = Some(gm);
        self.set_grandmaster(selected);

        for (idx, port) in ports.iter_mut().enumerate() {
            if !port.state().is_enabled() {
                continue;
            }
            let recommended = if local_wins || idx != ebest_port {
                PortState::Master
            } else {
                PortState::Slave
            };
            if recommended == PortState::Master && port.force_slave() {
                debug!("BMCA: port {} is slave-only, keeping {}", port.identity(), port.state());
                continue;
            }
            port.recommend_state(recommended, changed_master, self);
        }

        Some(BmcaOutcome {
            changed_master,
            local_wins,
        })
    }
}
