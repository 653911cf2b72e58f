//! Telemetry unpacking.
//!
//! Frames arrive on the multicast channel, are queued by the router and
//! applied here. Each `(category, instance)` pair keeps one [`Snapshot`]; a
//! frame only replaces it if its timestamp is strictly newer, so duplicated
//! or reordered datagrams never move the state backwards.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::TelemetryConfig;
use crate::error::ProtocolError;
use crate::liveness::Liveness;
use crate::logging::{LogLevel, LogSink};
use crate::protocol::{DataFrame, Device};
use crate::types::{HandState, TactileFrame};

/// Hand frames between periodic debug summaries.
const SUMMARY_INTERVAL: u64 = 10;

/// Telemetry category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Hand state.
    Hand,
    /// Tac3D sensor, one instance per serial number.
    Tactile,
}

impl Category {
    /// Maps a wire device name to its category.
    #[must_use]
    pub fn from_device(name: &str) -> Option<Self> {
        match Device::from_name(name)? {
            Device::Hand => Some(Self::Hand),
            Device::Tac3d => Some(Self::Tactile),
            Device::Server => None,
        }
    }
}

/// Identifies one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    /// Category.
    pub category: Category,
    /// Instance key; the serial number for tactile sensors.
    pub instance: Option<String>,
}

impl SnapshotKey {
    /// Key of the hand snapshot.
    #[must_use]
    pub const fn hand() -> Self {
        Self {
            category: Category::Hand,
            instance: None,
        }
    }

    /// Key of a tactile sensor's snapshot.
    #[must_use]
    pub fn tactile(serial: impl Into<String>) -> Self {
        Self {
            category: Category::Tactile,
            instance: Some(serial.into()),
        }
    }
}

/// Decoded payload of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotFields {
    /// Payload kept as received.
    Raw(Value),
    /// Typed hand state.
    Hand(HandState),
    /// Tactile frame.
    Tactile(TactileFrame),
}

/// Latest accepted state of one telemetry source.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Source of this snapshot.
    pub key: SnapshotKey,
    /// Sender timestamp of the accepted frame.
    pub recv_time: f64,
    /// Number of frames accepted so far.
    pub frame_count: u64,
    /// Decoded payload.
    pub fields: SnapshotFields,
}

impl Snapshot {
    /// Returns the hand state, if this is a decoded hand snapshot.
    #[must_use]
    pub const fn hand(&self) -> Option<&HandState> {
        match &self.fields {
            SnapshotFields::Hand(state) => Some(state),
            _ => None,
        }
    }

    /// Returns the tactile frame, if this is a decoded tactile snapshot.
    #[must_use]
    pub const fn tactile(&self) -> Option<&TactileFrame> {
        match &self.fields {
            SnapshotFields::Tactile(frame) => Some(frame),
            _ => None,
        }
    }

    /// Returns the raw payload, if decoding was disabled.
    #[must_use]
    pub const fn raw(&self) -> Option<&Value> {
        match &self.fields {
            SnapshotFields::Raw(value) => Some(value),
            _ => None,
        }
    }
}

/// Called once per accepted frame with the updated snapshot.
pub type SnapshotCallback = Arc<dyn Fn(&Arc<Snapshot>) + Send + Sync>;

/// Applies telemetry frames to per-source snapshots.
pub struct TelemetryUnpacker {
    config: TelemetryConfig,
    snapshots: Mutex<HashMap<SnapshotKey, Arc<Snapshot>>>,
    liveness: Arc<Liveness>,
    log: Arc<dyn LogSink>,
    on_update: Option<SnapshotCallback>,
}

impl TelemetryUnpacker {
    /// Creates an unpacker.
    #[must_use]
    pub fn new(
        config: TelemetryConfig,
        liveness: Arc<Liveness>,
        log: Arc<dyn LogSink>,
        on_update: Option<SnapshotCallback>,
    ) -> Self {
        Self {
            config,
            snapshots: Mutex::new(HashMap::new()),
            liveness,
            log,
            on_update,
        }
    }

    /// Returns true if frames of `category` are accepted.
    #[must_use]
    pub const fn is_enabled(&self, category: Category) -> bool {
        match category {
            Category::Hand => self.config.hand.is_some(),
            Category::Tactile => self.config.tactile,
        }
    }

    /// Applies a frame from the router.
    pub fn on_data(&self, frame: DataFrame) -> Result<Option<Arc<Snapshot>>, ProtocolError> {
        let category = Category::from_device(&frame.device)
            .ok_or_else(|| ProtocolError::UnknownDevice(frame.device.clone()))?;
        self.on_frame(category, frame.serial.as_deref(), frame.data, frame.time)
    }

    /// Applies one frame.
    ///
    /// Returns the updated snapshot, or `None` if the frame was not newer
    /// than the current one. Rejected frames leave no trace.
    pub fn on_frame(
        &self,
        category: Category,
        instance: Option<&str>,
        payload: Value,
        recv_time: f64,
    ) -> Result<Option<Arc<Snapshot>>, ProtocolError> {
        let key = self.key(category, instance)?;

        let snapshot = {
            let mut snapshots = self.snapshots.lock();
            let previous = snapshots.get(&key);
            // NaN never compares newer.
            if previous.is_some_and(|p| recv_time.partial_cmp(&p.recv_time) != Some(Ordering::Greater)) {
                tracing::trace!(?key, recv_time, "dropping stale telemetry frame");
                return Ok(None);
            }
            let frame_count = previous.map_or(0, |p| p.frame_count) + 1;
            let fields = self.decode(category, payload)?;

            let snapshot = Arc::new(Snapshot {
                key: key.clone(),
                recv_time,
                frame_count,
                fields,
            });
            snapshots.insert(key, Arc::clone(&snapshot));
            snapshot
        };

        self.liveness.on_telemetry();

        if snapshot.frame_count % SUMMARY_INTERVAL == 0 {
            if let Some(hand) = snapshot.hand() {
                self.log.log(LogLevel::Debug, &hand.summary(), false);
            }
        }

        if let Some(callback) = &self.on_update {
            callback(&snapshot);
        }
        Ok(Some(snapshot))
    }

    /// Returns the current snapshot for `key`.
    #[must_use]
    pub fn snapshot(&self, key: &SnapshotKey) -> Option<Arc<Snapshot>> {
        self.snapshots.lock().get(key).cloned()
    }

    /// Returns the serial numbers of all tactile sensors seen so far.
    #[must_use]
    pub fn tactile_serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self
            .snapshots
            .lock()
            .keys()
            .filter(|key| key.category == Category::Tactile)
            .filter_map(|key| key.instance.clone())
            .collect();
        serials.sort_unstable();
        serials
    }

    /// Consumes queued frames until the queue closes or `closed` fires.
    pub async fn run(
        self: Arc<Self>,
        mut frames: broadcast::Receiver<DataFrame>,
        closed: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                () = closed.cancelled() => return,
                frame = frames.recv() => frame,
            };
            match frame {
                Ok(frame) => {
                    if let Err(e) = self.on_data(frame) {
                        tracing::warn!("dropping telemetry frame: {e}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "telemetry consumer lagging, oldest frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    fn key(&self, category: Category, instance: Option<&str>) -> Result<SnapshotKey, ProtocolError> {
        if !self.is_enabled(category) {
            return Err(ProtocolError::UnregisteredCategory(
                device_name(category).to_owned(),
            ));
        }
        match category {
            Category::Hand => Ok(SnapshotKey::hand()),
            Category::Tactile => instance
                .map(SnapshotKey::tactile)
                .ok_or_else(|| ProtocolError::MissingInstanceKey {
                    device: device_name(category).to_owned(),
                }),
        }
    }

    fn decode(&self, category: Category, payload: Value) -> Result<SnapshotFields, ProtocolError> {
        if !self.config.auto_extract {
            return Ok(SnapshotFields::Raw(payload));
        }
        match (category, self.config.hand) {
            (Category::Hand, Some(components)) => HandState::extract(components, &payload)
                .map(SnapshotFields::Hand)
                .map_err(|source| ProtocolError::Payload {
                    device: device_name(category).to_owned(),
                    source,
                }),
            (Category::Hand, None) => Ok(SnapshotFields::Raw(payload)),
            (Category::Tactile, _) => Ok(SnapshotFields::Tactile(TactileFrame::new(payload))),
        }
    }
}

const fn device_name(category: Category) -> &'static str {
    match category {
        Category::Hand => Device::Hand.as_str(),
        Category::Tactile => Device::Tac3d.as_str(),
    }
}
