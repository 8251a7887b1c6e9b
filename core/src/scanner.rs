//! Target-peripheral scanner
//!
//! Wraps the radio's advertisement stream with a filter and a deadline. A
//! scan session yields at most one match and then ends; the radio scan is
//! stopped on every way out (match, timeout, or the driver ending the
//! stream). Dropping a session stream early leaves the radio scanning, so
//! owners that abandon a scan must call `RadioDriver::stop_scan` themselves.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::platform::{AdvertisementStream, RadioDriver};
use crate::types::{PeripheralIdentity, ScanFilter};

pub struct Scanner {
    radio: Arc<dyn RadioDriver>,
}

impl Scanner {
    pub fn new(radio: Arc<dyn RadioDriver>) -> Self {
        Self { radio }
    }

    /// Start a scan and return a lazy, finite stream of matches (zero or one).
    pub async fn scan(
        &self,
        filter: ScanFilter,
        timeout: Duration,
    ) -> Result<BoxStream<'static, PeripheralIdentity>, LinkError> {
        info!("Scanning for {} ({} ms window)", filter, timeout.as_millis());
        let advertisements = self.radio.start_scan(&filter).await?;

        let session = ScanSession {
            radio: Arc::clone(&self.radio),
            advertisements: Some(advertisements),
            filter,
            deadline: Instant::now() + timeout,
        };

        Ok(futures::stream::unfold(session, |mut session| async move {
            let found = session.next_match().await;
            found.map(|peripheral| (peripheral, session))
        })
        .boxed())
    }

    /// Scan until the first match, or fail with `ScanTimeout`.
    pub async fn find(
        &self,
        filter: ScanFilter,
        timeout: Duration,
    ) -> Result<PeripheralIdentity, LinkError> {
        let mut matches = self.scan(filter, timeout).await?;
        matches.next().await.ok_or(LinkError::ScanTimeout)
    }
}

struct ScanSession {
    radio: Arc<dyn RadioDriver>,
    /// `None` once the session has produced its result
    advertisements: Option<AdvertisementStream>,
    filter: ScanFilter,
    deadline: Instant,
}

impl ScanSession {
    async fn next_match(&mut self) -> Option<PeripheralIdentity> {
        let mut advertisements = self.advertisements.take()?;

        let found = loop {
            match tokio::time::timeout_at(self.deadline, advertisements.next()).await {
                Ok(Some(advertisement)) if self.filter.matches(&advertisement) => {
                    info!("Matched {} (rssi {:?})", advertisement.peripheral, advertisement.rssi);
                    break Some(advertisement.peripheral);
                }
                Ok(Some(advertisement)) => {
                    debug!("Ignoring {}", advertisement.peripheral);
                }
                Ok(None) => {
                    debug!("Radio ended the scan stream");
                    break None;
                }
                Err(_) => {
                    info!("Scan window elapsed without a match");
                    break None;
                }
            }
        };

        drop(advertisements);
        if let Err(e) = self.radio.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        found
    }
}
