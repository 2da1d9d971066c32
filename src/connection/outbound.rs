//! Outbound response queue.
//!
//! Complete responses wait here until the socket accepts them. The front
//! element may be partially written; `cursor` counts its bytes already sent.
//! A running byte count lets the connection stop reading when the client
//! falls too far behind.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io::IoSlice;

/// Most slices handed to a single vectored write.
pub const MAX_IOVECS: usize = 64;

/// Unsent reply bytes above which a connection stops reading requests (1 MiB).
pub const DEFAULT_MAX_PENDING_OUTPUT: usize = 1024 * 1024;

#[derive(Debug, Default)]
pub struct OutboundQueue {
    queue: VecDeque<Bytes>,
    cursor: usize,
    /// Unsent bytes across all elements
    pending: usize,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response. Empty responses are ignored.
    pub fn push(&mut self, response: Bytes) {
        if !response.is_empty() {
            self.pending += response.len();
            self.queue.push_back(response);
        }
    }

    /// Slices for the next vectored write: the unsent part of the front
    /// element followed by up to `max - 1` whole elements.
    pub fn io_slices(&self, max: usize) -> Vec<IoSlice<'_>> {
        self.queue
            .iter()
            .take(max)
            .enumerate()
            .map(|(i, response)| {
                if i == 0 {
                    IoSlice::new(&response[self.cursor..])
                } else {
                    IoSlice::new(response)
                }
            })
            .collect()
    }

    /// Records `n` bytes as written. Every fully written leading element is
    /// removed; the cursor ends inside the new front element.
    pub fn advance(&mut self, n: usize) -> usize {
        let mut left = n;
        let mut removed = 0;

        while let Some(front) = self.queue.front() {
            let unsent = front.len() - self.cursor;
            if left < unsent {
                self.cursor += left;
                left = 0;
                break;
            }

            left -= unsent;
            self.queue.pop_front();
            self.cursor = 0;
            removed += 1;
        }

        self.pending -= n - left;
        removed
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Bytes still to be written.
    pub fn pending_bytes(&self) -> usize {
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(items: &[&'static str]) -> OutboundQueue {
        let mut queue = OutboundQueue::new();
        for item in items {
            queue.push(Bytes::from_static(item.as_bytes()));
        }
        queue
    }

    #[test]
    fn test_partial_advance_moves_cursor() {
        let mut q = queue(&["STORED\r\n", "END\r\n"]);

        assert_eq!(q.advance(3), 0);
        assert_eq!(q.cursor(), 3);

        let slices = q.io_slices(MAX_IOVECS);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"RED\r\n");
        assert_eq!(&*slices[1], b"END\r\n");
    }

    #[test]
    fn test_advance_removes_all_written_elements() {
        let mut q = queue(&["a\r\n", "bb\r\n", "ccc\r\n"]);

        assert_eq!(q.advance(3 + 4 + 1), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.cursor(), 1);
        assert_eq!(q.pending_bytes(), 4);

        assert_eq!(q.advance(4), 1);
        assert!(q.is_empty());
        assert_eq!(q.cursor(), 0);
    }

    #[test]
    fn test_pending_bytes_tracks_push_and_advance() {
        let mut q = queue(&["STORED\r\n", "END\r\n"]);
        assert_eq!(q.pending_bytes(), 13);

        q.advance(10);
        assert_eq!(q.pending_bytes(), 3);

        q.push(Bytes::from_static(b"DELETED\r\n"));
        assert_eq!(q.pending_bytes(), 12);

        // Over-reporting cannot drive the count below zero.
        q.advance(100);
        assert_eq!(q.pending_bytes(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_io_slices_respects_limit() {
        let q = queue(&["1", "2", "3", "4"]);
        assert_eq!(q.io_slices(2).len(), 2);
    }

    #[test]
    fn test_empty_push_is_ignored() {
        let mut q = OutboundQueue::new();
        q.push(Bytes::new());
        assert!(q.is_empty());
        assert_eq!(q.pending_bytes(), 0);
    }
}
