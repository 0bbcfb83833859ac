use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{Channel, Sample};

/// Read-only copy of one channel's retained history.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSnapshot {
    pub channel: Channel,
    /// `(arrival index, value)`, oldest first. Indices count every push since
    /// the last reset, so they keep growing across evictions.
    pub points: Vec<(u64, f64)>,
}

impl ChannelSnapshot {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|&(_, v)| v)
    }

    /// `[x, y]` pairs ready for a line plot.
    pub fn plot_points(&self) -> Vec<[f64; 2]> {
        self.points.iter().map(|&(i, v)| [i as f64, v]).collect()
    }
}

struct ChannelRing {
    values: VecDeque<(u64, f64)>,
    pushed: u64,
}

impl ChannelRing {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            pushed: 0,
        }
    }

    fn push(&mut self, capacity: usize, value: f64) {
        if self.values.len() == capacity {
            self.values.pop_front();
        }
        self.values.push_back((self.pushed, value));
        self.pushed += 1;
    }

    fn clear(&mut self) {
        self.values.clear();
        self.pushed = 0;
    }
}

/// Bounded per-channel history backing the live plots.
///
/// Single writer (the acquisition worker), many readers. Every read copies
/// under a shared lock, so a reader never sees a half-applied push.
pub struct RingBufferStore {
    capacity: usize,
    channels: RwLock<Vec<ChannelRing>>,
}

impl RingBufferStore {
    /// `capacity` is clamped to at least one sample per channel.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let channels = Channel::ALL
            .iter()
            .map(|_| ChannelRing::with_capacity(capacity))
            .collect();
        Self {
            capacity,
            channels: RwLock::new(channels),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, channel: Channel, value: f64) {
        self.write()[channel.index()].push(self.capacity, value);
    }

    /// Pushes all 13 values of `sample` as one unit.
    pub fn push_sample(&self, sample: &Sample) {
        let mut channels = self.write();
        for (ring, value) in channels.iter_mut().zip(sample.values()) {
            ring.push(self.capacity, value);
        }
    }

    pub fn snapshot(&self, channel: Channel) -> ChannelSnapshot {
        let channels = self.read();
        ChannelSnapshot {
            channel,
            points: channels[channel.index()].values.iter().copied().collect(),
        }
    }

    pub fn latest(&self, channel: Channel) -> Option<f64> {
        self.read()[channel.index()].values.back().map(|&(_, v)| v)
    }

    /// Newest value of every channel, or `None` before the first sample.
    pub fn latest_sample_values(&self) -> Option<[f64; Channel::COUNT]> {
        let channels = self.read();
        let mut out = [0.0; Channel::COUNT];
        for (slot, ring) in out.iter_mut().zip(channels.iter()) {
            *slot = ring.values.back()?.1;
        }
        Some(out)
    }

    pub fn len(&self, channel: Channel) -> usize {
        self.read()[channel.index()].values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().iter().all(|ring| ring.values.is_empty())
    }

    pub fn total_pushed(&self, channel: Channel) -> u64 {
        self.read()[channel.index()].pushed
    }

    pub fn reset(&self) {
        for ring in self.write().iter_mut() {
            ring.clear();
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<ChannelRing>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<ChannelRing>> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn keeps_last_n_values_in_arrival_order() {
        let store = RingBufferStore::with_capacity(4);
        for i in 0..10 {
            store.push(Channel::Force, i as f64);
        }
        let snap = store.snapshot(Channel::Force);
        assert_eq!(
            snap.points,
            vec![(6, 6.0), (7, 7.0), (8, 8.0), (9, 9.0)]
        );
        assert_eq!(store.len(Channel::Force), 4);
        assert_eq!(store.total_pushed(Channel::Force), 10);
        assert_eq!(store.latest(Channel::Force), Some(9.0));
        assert!(store.snapshot(Channel::Rpm).is_empty());
    }

    #[test]
    fn partial_fill_returns_everything_seen() {
        let store = RingBufferStore::with_capacity(100);
        store.push(Channel::Ir3, 1.5);
        store.push(Channel::Ir3, 2.5);
        let values: Vec<f64> = store.snapshot(Channel::Ir3).values().collect();
        assert_eq!(values, vec![1.5, 2.5]);
    }

    #[test]
    fn push_sample_fills_every_channel() {
        let store = RingBufferStore::with_capacity(2);
        assert_eq!(store.latest_sample_values(), None);
        let mut values = [0.0; Channel::COUNT];
        for (i, v) in values.iter_mut().enumerate() {
            *v = i as f64 * 10.0;
        }
        store.push_sample(&Sample::from_values(1, values));
        assert_eq!(store.latest_sample_values(), Some(values));
        for channel in Channel::ALL {
            assert_eq!(store.latest(channel), Some(channel.index() as f64 * 10.0));
        }
    }

    #[test]
    fn reset_clears_all_channels_and_indices() {
        let store = RingBufferStore::with_capacity(3);
        store.push_sample(&Sample::from_values(1, [1.0; Channel::COUNT]));
        assert!(!store.is_empty());
        store.reset();
        assert!(store.is_empty());
        store.push(Channel::Rpm, 5.0);
        assert_eq!(store.snapshot(Channel::Rpm).points, vec![(0, 5.0)]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let store = RingBufferStore::with_capacity(0);
        store.push(Channel::Pressure, 1.0);
        store.push(Channel::Pressure, 2.0);
        assert_eq!(store.capacity(), 1);
        assert_eq!(store.snapshot(Channel::Pressure).points, vec![(1, 2.0)]);
    }

    #[test]
    fn readers_never_see_half_a_sample() {
        let store = Arc::new(RingBufferStore::with_capacity(16));
        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..2000 {
                    store.push_sample(&Sample::from_values(i, [i as f64; Channel::COUNT]));
                }
            })
        };
        for _ in 0..2000 {
            if let Some(values) = store.latest_sample_values() {
                assert!(values.iter().all(|&v| v == values[0]));
            }
        }
        writer.join().unwrap();
        assert_eq!(store.latest(Channel::Ir1), Some(1999.0));
    }
}
