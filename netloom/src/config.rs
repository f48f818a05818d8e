use std::time::Duration;

// Upper bound on one poll wait when no timer is due sooner; bounds idle
// wakeups.
pub const DEFAULT_POLL_CAP: Duration = Duration::from_millis(250);

// Bytes pulled from a socket per read call while draining readiness.
pub const DEFAULT_READ_CHUNK: usize = 4096;

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ReactorConfig {

    pub poll_cap: Duration,

    pub read_chunk: usize,

    pub events_capacity: usize,

}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            poll_cap: DEFAULT_POLL_CAP,
            read_chunk: DEFAULT_READ_CHUNK,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
        }
    }
}
