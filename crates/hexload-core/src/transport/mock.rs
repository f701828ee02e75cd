//! Mock APDU transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::traits::{ApduTransport, TransportError};
use crate::protocol::Apdu;

#[derive(Debug, Clone)]
enum Reply {
    Data(Vec<u8>),
    Status(u16),
}

/// Mock transport for unit testing session logic.
///
/// Clones share state, so a test can keep one handle while the session owns
/// another. Commands with no queued reply get an empty response, which is
/// what the bootloader answers to every segment command.
#[derive(Clone, Default)]
pub struct MockTransport {
    /// Queued replies, consumed in order.
    replies: Arc<Mutex<VecDeque<Reply>>>,
    /// Captured frames.
    sent: Arc<Mutex<Vec<Apdu>>>,
    /// Whether device is "connected".
    disconnected: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue response data for the next exchange.
    pub fn queue_response(&self, data: &[u8]) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Reply::Data(data.to_vec()));
    }

    /// Make the next exchange fail with a status word.
    pub fn queue_status(&self, sw: u16) {
        self.replies.lock().unwrap().push_back(Reply::Status(sw));
    }

    /// Get all captured frames.
    pub fn sent(&self) -> Vec<Apdu> {
        self.sent.lock().unwrap().clone()
    }

    /// Clear captured frames.
    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.disconnected.lock().unwrap() = true;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.disconnected.lock().unwrap() = false;
    }
}

impl ApduTransport for MockTransport {
    fn exchange(&self, apdu: &Apdu) -> Result<Vec<u8>, TransportError> {
        if *self.disconnected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.sent.lock().unwrap().push(apdu.clone());
        match self.replies.lock().unwrap().pop_front() {
            Some(Reply::Data(data)) => Ok(data),
            Some(Reply::Status(sw)) => Err(TransportError::Status { sw }),
            None => Ok(Vec::new()),
        }
    }

    fn is_connected(&self) -> bool {
        !*self.disconnected.lock().unwrap()
    }
}
