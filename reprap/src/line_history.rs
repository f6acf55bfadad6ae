use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Bounded ring of recently sent lines, keyed by line number, serving the
/// resend fast path.
///
/// Grounded on the same bounded-ring-plus-index shape the teacher uses for
/// its receive-side line buffer (`serial_receiver_buffer::SerialReceiverBuffer`):
/// oldest entries are evicted once the ring exceeds capacity, and lookups are
/// done by absolute line number rather than position in the ring.
pub struct LineHistory {
    inner: Mutex<Inner>,
}

struct Inner {
    capacity: usize,
    order: VecDeque<u64>,
    lines: HashMap<u64, Vec<u8>>,
}

impl LineHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity: capacity.max(1),
                order: VecDeque::new(),
                lines: HashMap::new(),
            }),
        }
    }

    pub fn append(&self, line_number: u64, line: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.lines.insert(line_number, line);
        inner.order.push_back(line_number);

        while inner.order.len() > inner.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.lines.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, line_number: u64) -> bool {
        self.inner.lock().unwrap().lines.contains_key(&line_number)
    }

    pub fn get(&self, line_number: u64) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().lines.get(&line_number).cloned()
    }

    pub fn oldest(&self) -> Option<u64> {
        self.inner.lock().unwrap().order.front().copied()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.order.clear();
        inner.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
