//! Link readiness: waiting for carrier on a freshly moved interface.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, instrument};

use sriov_cni_common::{LinkOps, SriovError, SriovResult};

use crate::config::defaults;

/// Polls a link until it is administratively up with carrier.
#[derive(Clone)]
pub struct CarrierWaiter {
    links: Arc<dyn LinkOps>,
    poll_interval: Duration,
}

impl CarrierWaiter {
    pub fn new(links: Arc<dyn LinkOps>) -> Self {
        Self {
            links,
            poll_interval: Duration::from_millis(defaults::CARRIER_POLL_INTERVAL_MS),
        }
    }

    /// Waits until `ifname` in `netns` reports IFF_UP and IFF_RUNNING.
    ///
    /// Returns `Ok(true)` as soon as the link is ready and `Ok(false)` once
    /// `timeout` has elapsed without it. Lookup errors count as not ready;
    /// if the last lookup before the deadline failed, the result is
    /// [`SriovError::DeviceNotFound`] instead of `Ok(false)`.
    #[instrument(skip(self))]
    pub async fn wait_for_carrier(
        &self,
        netns: Option<&str>,
        ifname: &str,
        timeout: Duration,
    ) -> SriovResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut last_error: Option<SriovError> = None;

        loop {
            match timeout_at(deadline, self.links.link(netns, ifname)).await {
                Ok(Ok(link)) if link.has_carrier() => {
                    debug!(ifname = %ifname, "Link has carrier");
                    return Ok(true);
                }
                Ok(Ok(_)) => last_error = None,
                Ok(Err(err)) => last_error = Some(err),
                Err(_) => break,
            }

            let next = Instant::now() + self.poll_interval;
            if next >= deadline {
                sleep_until(deadline).await;
                break;
            }
            sleep_until(next).await;
        }

        match last_error {
            None => Ok(false),
            Some(err) if err.is_not_found() => Err(err),
            Some(err) => Err(SriovError::device_not_found(ifname, err.to_string())),
        }
    }
}
