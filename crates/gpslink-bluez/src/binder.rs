//! Binding endpoints to `/dev/rfcommN` device files.
//!
//! The bound device is a system-wide, exclusively-owned resource. A
//! successful [`DeviceBinder::bind`] returns a [`DeviceLease`]; releasing
//! it (explicitly, or on drop as a fallback) is the only way the slot is
//! given back.
//!
//! **Panic-Free Policy:** no `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside of tests.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use gpslink_core::{Channel, Endpoint};

use crate::binding::{BindError, BindingFacility};
use crate::transport::{Connector, Link, TransportError};

/// Device file name prefix; slot `n` maps to `<device_dir>/rfcomm<n>`.
const DEVICE_PREFIX: &str = "rfcomm";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct BinderConfig {
    /// Directory holding the device files.
    pub device_dir: PathBuf,
    /// First slot number scanned.
    pub first_slot: u8,
    /// Last slot number scanned (inclusive).
    pub last_slot: u8,
    /// Deadline for one invocation of the binding facility.
    pub bind_timeout: Duration,
    /// How long the device path may take to appear after a bind.
    pub grace_period: Duration,
    /// Polling interval while waiting for the device path.
    pub poll_interval: Duration,
    /// Channels tried after the endpoint's own channel, in order.
    pub channel_guesses: Vec<Channel>,
}

impl BinderConfig {
    /// Upper bound on one full [`DeviceBinder::bind`]: every guess pays a
    /// release, a bind and the grace period.
    pub fn worst_case_bind(&self) -> Duration {
        let guesses = u32::try_from(self.channel_guesses.len().saturating_add(1)).unwrap_or(u32::MAX);
        self.bind_timeout
            .saturating_mul(2)
            .saturating_add(self.grace_period)
            .saturating_mul(guesses)
    }
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from("/dev"),
            first_slot: 0,
            last_slot: 9,
            bind_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            channel_guesses: (1..=5).filter_map(|n| Channel::new(n).ok()).collect(),
        }
    }
}

// ============================================================================
// Device Lease
// ============================================================================

/// Exclusive hold on one bound device slot.
///
/// Call [`DeviceLease::release`] when done. If the lease is dropped
/// without it, a release is spawned on the current runtime.
pub struct DeviceLease {
    path: PathBuf,
    slot: u8,
    endpoint: Endpoint,
    facility: Option<Arc<dyn BindingFacility>>,
}

impl fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLease")
            .field("path", &self.path)
            .field("slot", &self.slot)
            .field("endpoint", &self.endpoint)
            .field("held", &self.facility.is_some())
            .finish()
    }
}

impl DeviceLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// The endpoint as actually bound (channel may differ from the request).
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Releases the slot. Never fails; facility errors are logged.
    pub async fn release(mut self) {
        if let Some(facility) = self.facility.take() {
            release_slot(facility.as_ref(), self.slot, &self.path).await;
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let Some(facility) = self.facility.take() else {
            return;
        };
        let slot = self.slot;
        let path = self.path.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(path = %path.display(), "Lease dropped; releasing in background");
                handle.spawn(async move {
                    release_slot(facility.as_ref(), slot, &path).await;
                });
            }
            Err(_) => {
                warn!(path = %path.display(), "Lease dropped outside a runtime; slot left bound");
            }
        }
    }
}

async fn release_slot(facility: &dyn BindingFacility, slot: u8, path: &Path) {
    match facility.release(slot).await {
        Ok(()) => info!(path = %path.display(), "Released bound device"),
        Err(e) => warn!(path = %path.display(), error = %e, "Release failed; continuing"),
    }
}

// ============================================================================
// Device Binder
// ============================================================================

/// Allocates a free slot and binds it to an endpoint.
pub struct DeviceBinder {
    facility: Arc<dyn BindingFacility>,
    config: BinderConfig,
}

impl DeviceBinder {
    pub fn new(facility: Arc<dyn BindingFacility>, config: BinderConfig) -> Self {
        Self { facility, config }
    }

    pub fn config(&self) -> &BinderConfig {
        &self.config
    }

    /// Device path for a slot.
    pub fn device_path(&self, slot: u8) -> PathBuf {
        self.config.device_dir.join(format!("{DEVICE_PREFIX}{slot}"))
    }

    /// First slot in range whose device path does not exist yet.
    pub async fn free_slot(&self) -> Option<u8> {
        for slot in self.config.first_slot..=self.config.last_slot {
            if !path_exists(&self.device_path(slot)).await {
                return Some(slot);
            }
        }
        None
    }

    /// Channels tried for `endpoint`: its own first, then the guesses.
    pub fn channel_guesses(&self, endpoint: &Endpoint) -> Vec<Channel> {
        let mut guesses = vec![endpoint.channel()];
        for channel in &self.config.channel_guesses {
            if !guesses.contains(channel) {
                guesses.push(*channel);
            }
        }
        guesses
    }

    /// Binds `endpoint` to the first free slot.
    ///
    /// Each channel guess gets a fresh release of the slot, a bounded
    /// bind, and a grace period for the device path to appear.
    pub async fn bind(&self, endpoint: &Endpoint) -> Result<DeviceLease, BindError> {
        let slot = self.free_slot().await.ok_or_else(|| BindError::NoFreeSlot {
            dir: self.config.device_dir.clone(),
        })?;
        let path = self.device_path(slot);
        let guesses = self.channel_guesses(endpoint);

        for channel in &guesses {
            let candidate = endpoint.with_channel(*channel);

            // Stale bindings on this slot make bind fail; ignore errors.
            let _ = self.facility.release(slot).await;

            match timeout(self.config.bind_timeout, self.facility.bind(slot, &candidate)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(slot, %channel, error = %e, "Bind attempt failed");
                    continue;
                }
                Err(_) => {
                    debug!(slot, %channel, timeout = ?self.config.bind_timeout, "Bind attempt timed out");
                    continue;
                }
            }

            if self.wait_for_path(&path).await {
                info!(path = %path.display(), endpoint = %candidate, "Bound device");
                return Ok(DeviceLease {
                    path,
                    slot,
                    endpoint: candidate,
                    facility: Some(Arc::clone(&self.facility)),
                });
            }

            debug!(path = %path.display(), %channel, "Device path did not appear");
            let _ = self.facility.release(slot).await;
        }

        Err(BindError::Exhausted {
            endpoint: *endpoint,
            tried: guesses
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        })
    }

    /// Releases whatever is bound at `path`.
    ///
    /// Safe to call repeatedly and on paths that were never bound.
    pub async fn release(&self, path: &Path) {
        match slot_from_path(path) {
            Some(slot) => release_slot(self.facility.as_ref(), slot, path).await,
            None => warn!(path = %path.display(), "Not an RFCOMM device path; nothing to release"),
        }
    }

    async fn wait_for_path(&self, path: &Path) -> bool {
        let deadline = Instant::now() + self.config.grace_period;
        loop {
            if path_exists(path).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.config.poll_interval).await;
        }
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn slot_from_path(path: &Path) -> Option<u8> {
    path.file_name()?
        .to_str()?
        .strip_prefix(DEVICE_PREFIX)?
        .parse()
        .ok()
}

// ============================================================================
// Bound-device Connector
// ============================================================================

/// [`Connector`] that streams from a freshly bound device file.
///
/// The returned [`Link`] owns the lease, so closing the link unbinds.
pub struct DeviceConnector {
    binder: DeviceBinder,
}

impl DeviceConnector {
    pub fn new(binder: DeviceBinder) -> Self {
        Self { binder }
    }
}

#[async_trait]
impl Connector for DeviceConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, TransportError> {
        let lease = self.binder.bind(endpoint).await?;
        let path = lease.path().to_path_buf();

        let file = match tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(source) => {
                lease.release().await;
                return Err(TransportError::Open { path, source });
            }
        };

        Ok(Link::new(file, format!("device {}", path.display())).with_lease(lease))
    }

    fn kind(&self) -> &'static str {
        "device"
    }

    /// Binding runs inside the connect, so its worst case extends the deadline.
    fn connect_deadline(&self, connect_timeout: Duration) -> Duration {
        connect_timeout.saturating_add(self.binder.config().worst_case_bind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use gpslink_core::BtAddress;

    // ------------------------------------------------------------------------
    // Fake facility
    // ------------------------------------------------------------------------

    /// Creates the device file on a successful bind, like the kernel does.
    struct FakeFacility {
        dir: PathBuf,
        working_channel: Option<Channel>,
        create_path: bool,
        fail_release: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeFacility {
        fn new(dir: &Path, working_channel: Option<u16>) -> Self {
            Self {
                dir: dir.to_path_buf(),
                working_channel: working_channel.map(|n| Channel::new(n).unwrap()),
                create_path: true,
                fail_release: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BindingFacility for FakeFacility {
        async fn bind(&self, slot: u8, endpoint: &Endpoint) -> Result<(), BindError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("bind {slot} {}", endpoint.channel()));
            if Some(endpoint.channel()) != self.working_channel {
                return Err(BindError::Other("Can't create device".to_string()));
            }
            if self.create_path {
                std::fs::write(self.dir.join(format!("rfcomm{slot}")), b"")
                    .map_err(|e| BindError::Other(e.to_string()))?;
            }
            Ok(())
        }

        async fn release(&self, slot: u8) -> Result<(), BindError> {
            self.calls.lock().unwrap().push(format!("release {slot}"));
            let _ = std::fs::remove_file(self.dir.join(format!("rfcomm{slot}")));
            if self.fail_release {
                Err(BindError::Other("not bound".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn endpoint(channel: u16) -> Endpoint {
        Endpoint::new(
            "AA:BB:CC:DD:EE:FF".parse::<BtAddress>().unwrap(),
            Channel::new(channel).unwrap(),
        )
    }

    fn config(dir: &Path) -> BinderConfig {
        BinderConfig {
            device_dir: dir.to_path_buf(),
            grace_period: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------------
    // Slot allocation
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_first_free_slot_is_used() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rfcomm0"), b"").unwrap();
        std::fs::write(dir.path().join("rfcomm1"), b"").unwrap();

        let facility = Arc::new(FakeFacility::new(dir.path(), Some(1)));
        let binder = DeviceBinder::new(facility.clone(), config(dir.path()));

        let lease = binder.bind(&endpoint(1)).await.unwrap();
        assert_eq!(lease.slot(), 2);
        assert_eq!(lease.path(), dir.path().join("rfcomm2"));
        lease.release().await;
    }

    #[tokio::test]
    async fn test_no_free_slot() {
        let dir = tempfile::tempdir().unwrap();
        for slot in 0..=1 {
            std::fs::write(dir.path().join(format!("rfcomm{slot}")), b"").unwrap();
        }
        let facility = Arc::new(FakeFacility::new(dir.path(), Some(1)));
        let binder = DeviceBinder::new(
            facility.clone(),
            BinderConfig {
                last_slot: 1,
                ..config(dir.path())
            },
        );

        let err = binder.bind(&endpoint(1)).await.unwrap_err();
        assert!(matches!(err, BindError::NoFreeSlot { .. }));
        assert!(facility.calls().is_empty());
    }

    // ------------------------------------------------------------------------
    // Channel guesses
    // ------------------------------------------------------------------------

    #[test]
    fn test_guesses_start_with_endpoint_channel_without_duplicates() {
        let dir = PathBuf::from("/nonexistent");
        let binder = DeviceBinder::new(Arc::new(FakeFacility::new(&dir, None)), config(&dir));

        let guesses: Vec<u8> = binder
            .channel_guesses(&endpoint(3))
            .iter()
            .map(|c| c.get())
            .collect();
        assert_eq!(guesses, vec![3, 1, 2, 4, 5]);
    }

    #[tokio::test]
    async fn test_bind_walks_channel_guesses() {
        let dir = tempfile::tempdir().unwrap();
        let facility = Arc::new(FakeFacility::new(dir.path(), Some(2)));
        let binder = DeviceBinder::new(facility.clone(), config(dir.path()));

        let lease = binder.bind(&endpoint(3)).await.unwrap();
        assert_eq!(lease.endpoint().channel().get(), 2);
        assert_eq!(
            facility.calls(),
            vec!["release 0", "bind 0 3", "release 0", "bind 0 1", "release 0", "bind 0 2"]
        );
        lease.release().await;
        assert_eq!(facility.calls().last().map(String::as_str), Some("release 0"));
    }

    #[tokio::test]
    async fn test_bind_fails_when_path_never_appears() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeFacility::new(dir.path(), Some(1));
        fake.create_path = false;
        let binder = DeviceBinder::new(
            Arc::new(fake),
            BinderConfig {
                channel_guesses: vec![Channel::SPP_DEFAULT],
                ..config(dir.path())
            },
        );

        let err = binder.bind(&endpoint(1)).await.unwrap_err();
        match err {
            BindError::Exhausted { tried, .. } => assert_eq!(tried, "1"),
            other => panic!("Expected Exhausted, got {other:?}"),
        }
    }

    // ------------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_release_is_repeatable_and_never_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeFacility::new(dir.path(), Some(1));
        fake.fail_release = true;
        let facility = Arc::new(fake);
        let binder = DeviceBinder::new(facility.clone(), config(dir.path()));

        let path = dir.path().join("rfcomm4");
        binder.release(&path).await;
        binder.release(&path).await;
        binder.release(Path::new("/tmp/not-a-device")).await;

        assert_eq!(facility.calls(), vec!["release 4", "release 4"]);
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let facility = Arc::new(FakeFacility::new(dir.path(), Some(1)));
        let binder = DeviceBinder::new(facility.clone(), config(dir.path()));

        let lease = binder.bind(&endpoint(1)).await.unwrap();
        let before = facility.calls().len();
        drop(lease);

        for _ in 0..50 {
            if facility.calls().len() > before {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(facility.calls().len(), before + 1);
        assert!(!dir.path().join("rfcomm0").exists());
    }

    #[test]
    fn test_worst_case_bind() {
        // 6 guesses (endpoint channel + 5), each 5 s release + 5 s bind + 1 s grace
        assert_eq!(
            BinderConfig::default().worst_case_bind(),
            Duration::from_secs(66)
        );
    }

    #[test]
    fn test_slot_from_path() {
        assert_eq!(slot_from_path(Path::new("/dev/rfcomm7")), Some(7));
        assert_eq!(slot_from_path(Path::new("/dev/ttyUSB0")), None);
        assert_eq!(slot_from_path(Path::new("/dev/rfcomm")), None);
    }

    // ------------------------------------------------------------------------
    // Connector
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_device_connector_opens_bound_path_and_releases_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let facility = Arc::new(FakeFacility::new(dir.path(), Some(1)));
        let connector = DeviceConnector::new(DeviceBinder::new(facility.clone(), config(dir.path())));

        let link = connector.connect(&endpoint(1)).await.unwrap();
        assert_eq!(connector.kind(), "device");
        assert!(link.description().contains("rfcomm0"));
        assert!(link.lease().is_some());

        link.close().await;
        assert_eq!(facility.calls().last().map(String::as_str), Some("release 0"));
    }
}
