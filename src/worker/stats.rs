//! Ray and queue statistics reported by workers.

use crate::error::{Error, Result};
use crate::messages::{Message, OpCode};
use crate::rays::TreeletId;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

/// Ray counters for one treelet (or the aggregate over all of them).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RayStats {
    /// Rays sent to another worker for this treelet.
    pub sent_rays: u64,

    /// Rays received from other workers for this treelet.
    pub received_rays: u64,

    /// Rays enqueued for local processing.
    pub waiting_rays: u64,

    /// Rays processed locally.
    pub processed_rays: u64,

    /// Rays that required this treelet to make progress.
    pub demanded_rays: u64,

    /// Rays waiting to be sent to a known holder.
    pub sending_rays: u64,

    /// Rays waiting for a holder to be discovered.
    pub pending_rays: u64,
}

impl RayStats {
    /// Zero all counters.
    pub fn reset(&mut self) {
        *self = RayStats::default();
    }

    /// Add another set of counters into this one.
    ///
    /// * `other` - The counters to merge.
    pub fn merge(&mut self, other: &RayStats) {
        self.sent_rays += other.sent_rays;
        self.received_rays += other.received_rays;
        self.waiting_rays += other.waiting_rays;
        self.processed_rays += other.processed_rays;
        self.demanded_rays += other.demanded_rays;
        self.sending_rays += other.sending_rays;
        self.pending_rays += other.pending_rays;
    }
}

/// Queue depths at the time a stats message was built.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ray: u64,
    pub finished: u64,
    pub pending: u64,
    pub out: u64,
    pub connecting: u64,
    pub connected: u64,
    pub outstanding_udp: u64,
}

macro_rules! record_fn {
    ($(#[$doc:meta])* $name:ident, $field:ident) => {
        $(#[$doc])*
        pub fn $name(&mut self, treelet: TreeletId) {
            self.aggregate.$field += 1;
            self.object_stats.entry(treelet).or_default().$field += 1;
        }
    };
}

/// The full statistics block a worker publishes on each stats interval,
/// and that the coordinator merges into its global view.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerStats {
    /// Paths that finished on this worker.
    pub finished_paths: u64,

    /// Counters aggregated over all treelets.
    pub aggregate: RayStats,

    /// Counters per treelet.
    pub object_stats: BTreeMap<TreeletId, RayStats>,

    /// Queue depths.
    pub queue_stats: QueueStats,

    /// Transport bytes sent since the last reset.
    pub bytes_sent: u64,

    /// Transport bytes received since the last reset.
    pub bytes_received: u64,

    /// Wall-clock microseconds per named event-loop action; populated
    /// only on diagnostics requests.
    pub time_per_action: BTreeMap<String, u64>,
}

impl WorkerStats {
    record_fn!(
        /// Record a ray sent to a peer.
        record_sent_ray,
        sent_rays
    );
    record_fn!(
        /// Record a ray received from a peer.
        record_received_ray,
        received_rays
    );
    record_fn!(
        /// Record a ray entering the local ray queue.
        record_waiting_ray,
        waiting_rays
    );
    record_fn!(
        /// Record a ray popped for processing.
        record_processed_ray,
        processed_rays
    );
    record_fn!(
        /// Record a ray demanding a treelet.
        record_demanded_ray,
        demanded_rays
    );
    record_fn!(
        /// Record a ray queued toward a known holder.
        record_sending_ray,
        sending_rays
    );
    record_fn!(
        /// Record a ray parked until a holder is discovered.
        record_pending_ray,
        pending_rays
    );

    /// Record one finished path.
    pub fn record_finished_path(&mut self) {
        self.finished_paths += 1;
    }

    /// Zero all counters; called after each stats publish.
    pub fn reset(&mut self) {
        self.finished_paths = 0;
        self.aggregate.reset();
        self.object_stats.clear();
        self.queue_stats = QueueStats::default();
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.time_per_action.clear();
    }

    /// Merge another worker's interval stats into this block. Queue
    /// depths are snapshots, not counters, so they are replaced.
    ///
    /// * `other` - The stats to merge.
    pub fn merge(&mut self, other: &WorkerStats) {
        self.finished_paths += other.finished_paths;
        self.aggregate.merge(&other.aggregate);
        for (treelet, stats) in &other.object_stats {
            self.object_stats.entry(*treelet).or_default().merge(stats);
        }
        self.queue_stats = other.queue_stats;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        for (name, micros) in &other.time_per_action {
            *self.time_per_action.entry(name.clone()).or_default() += micros;
        }
    }

    /// Serialize into a `WorkerStats` message.
    pub fn to_message(&self) -> Message {
        let mut w = Vec::with_capacity(256);
        w.write_u64::<BigEndian>(self.finished_paths).unwrap();
        write_ray_stats(&mut w, &self.aggregate);

        w.write_u64::<BigEndian>(self.queue_stats.ray).unwrap();
        w.write_u64::<BigEndian>(self.queue_stats.finished).unwrap();
        w.write_u64::<BigEndian>(self.queue_stats.pending).unwrap();
        w.write_u64::<BigEndian>(self.queue_stats.out).unwrap();
        w.write_u64::<BigEndian>(self.queue_stats.connecting).unwrap();
        w.write_u64::<BigEndian>(self.queue_stats.connected).unwrap();
        w.write_u64::<BigEndian>(self.queue_stats.outstanding_udp).unwrap();

        w.write_u64::<BigEndian>(self.bytes_sent).unwrap();
        w.write_u64::<BigEndian>(self.bytes_received).unwrap();

        w.write_u32::<BigEndian>(self.object_stats.len() as u32).unwrap();
        for (treelet, stats) in &self.object_stats {
            w.write_u32::<BigEndian>(*treelet).unwrap();
            write_ray_stats(&mut w, stats);
        }

        w.write_u32::<BigEndian>(self.time_per_action.len() as u32).unwrap();
        for (name, micros) in &self.time_per_action {
            w.write_u16::<BigEndian>(name.len() as u16).unwrap();
            w.extend_from_slice(name.as_bytes());
            w.write_u64::<BigEndian>(*micros).unwrap();
        }

        Message::new(OpCode::WorkerStats, w)
    }

    /// Deserialize from a `WorkerStats` payload.
    ///
    /// * `payload` - The payload bytes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(payload);
        let mut stats = WorkerStats {
            finished_paths: truncated(r.read_u64::<BigEndian>())?,
            aggregate: read_ray_stats(&mut r)?,
            ..WorkerStats::default()
        };

        stats.queue_stats = QueueStats {
            ray: truncated(r.read_u64::<BigEndian>())?,
            finished: truncated(r.read_u64::<BigEndian>())?,
            pending: truncated(r.read_u64::<BigEndian>())?,
            out: truncated(r.read_u64::<BigEndian>())?,
            connecting: truncated(r.read_u64::<BigEndian>())?,
            connected: truncated(r.read_u64::<BigEndian>())?,
            outstanding_udp: truncated(r.read_u64::<BigEndian>())?,
        };
        stats.bytes_sent = truncated(r.read_u64::<BigEndian>())?;
        stats.bytes_received = truncated(r.read_u64::<BigEndian>())?;

        let n_objects = truncated(r.read_u32::<BigEndian>())?;
        for _ in 0..n_objects {
            let treelet = truncated(r.read_u32::<BigEndian>())?;
            stats.object_stats.insert(treelet, read_ray_stats(&mut r)?);
        }

        let n_actions = truncated(r.read_u32::<BigEndian>())?;
        for _ in 0..n_actions {
            let len = truncated(r.read_u16::<BigEndian>())? as usize;
            let mut name = vec![0u8; len];
            truncated(r.read_exact(&mut name))?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::Protocol("action name is not utf-8".to_string()))?;
            stats
                .time_per_action
                .insert(name, truncated(r.read_u64::<BigEndian>())?);
        }

        Ok(stats)
    }
}

fn truncated<T>(res: std::io::Result<T>) -> Result<T> {
    res.map_err(|_| Error::Protocol("truncated stats payload".to_string()))
}

fn write_ray_stats(w: &mut Vec<u8>, stats: &RayStats) {
    w.write_u64::<BigEndian>(stats.sent_rays).unwrap();
    w.write_u64::<BigEndian>(stats.received_rays).unwrap();
    w.write_u64::<BigEndian>(stats.waiting_rays).unwrap();
    w.write_u64::<BigEndian>(stats.processed_rays).unwrap();
    w.write_u64::<BigEndian>(stats.demanded_rays).unwrap();
    w.write_u64::<BigEndian>(stats.sending_rays).unwrap();
    w.write_u64::<BigEndian>(stats.pending_rays).unwrap();
}

fn read_ray_stats<R: Read>(r: &mut R) -> Result<RayStats> {
    Ok(RayStats {
        sent_rays: truncated(r.read_u64::<BigEndian>())?,
        received_rays: truncated(r.read_u64::<BigEndian>())?,
        waiting_rays: truncated(r.read_u64::<BigEndian>())?,
        processed_rays: truncated(r.read_u64::<BigEndian>())?,
        demanded_rays: truncated(r.read_u64::<BigEndian>())?,
        sending_rays: truncated(r.read_u64::<BigEndian>())?,
        pending_rays: truncated(r.read_u64::<BigEndian>())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_helpers_bump_both_aggregate_and_per_treelet_counters() {
        let mut stats = WorkerStats::default();
        stats.record_sent_ray(1);
        stats.record_sent_ray(1);
        stats.record_sent_ray(2);
        stats.record_pending_ray(2);

        assert_eq!(stats.aggregate.sent_rays, 3);
        assert_eq!(stats.object_stats[&1].sent_rays, 2);
        assert_eq!(stats.object_stats[&2].sent_rays, 1);
        assert_eq!(stats.object_stats[&2].pending_rays, 1);
    }

    #[test]
    fn per_treelet_sums_match_the_aggregate() {
        let mut stats = WorkerStats::default();
        for treelet in [1, 2, 3, 2, 1, 1] {
            stats.record_waiting_ray(treelet);
            stats.record_processed_ray(treelet);
        }
        let waiting: u64 = stats.object_stats.values().map(|s| s.waiting_rays).sum();
        let processed: u64 = stats.object_stats.values().map(|s| s.processed_rays).sum();
        assert_eq!(waiting, stats.aggregate.waiting_rays);
        assert_eq!(processed, stats.aggregate.processed_rays);
    }

    #[test]
    fn stats_round_trip_through_the_codec() {
        let mut stats = WorkerStats::default();
        stats.record_finished_path();
        stats.record_sent_ray(4);
        stats.record_received_ray(7);
        stats.queue_stats.ray = 11;
        stats.queue_stats.outstanding_udp = 3;
        stats.bytes_sent = 1_000;
        stats.bytes_received = 2_000;
        stats.time_per_action.insert("handleRayQueue".to_string(), 1234);

        let msg = stats.to_message();
        assert_eq!(msg.opcode, OpCode::WorkerStats);
        assert_eq!(WorkerStats::decode(&msg.payload).unwrap(), stats);
    }

    #[test]
    fn merge_accumulates_counters_and_replaces_queue_depths() {
        let mut global = WorkerStats::default();
        let mut interval = WorkerStats::default();
        interval.record_finished_path();
        interval.record_sent_ray(1);
        interval.queue_stats.ray = 5;

        global.merge(&interval);
        global.merge(&interval);

        assert_eq!(global.finished_paths, 2);
        assert_eq!(global.aggregate.sent_rays, 2);
        assert_eq!(global.queue_stats.ray, 5);
    }

    #[test]
    fn reset_zeroes_everything() {
        let mut stats = WorkerStats::default();
        stats.record_sent_ray(1);
        stats.queue_stats.out = 9;
        stats.reset();
        assert_eq!(stats, WorkerStats::default());
    }
}
