//! Scripted transport for unit tests

use std::collections::VecDeque;

use nexum_apdu_core::{Bytes, CardTransport, TransportError};

#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    responses: VecDeque<Result<Bytes, TransportError>>,
    pub(crate) commands: Vec<Bytes>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a reply given as payload followed by the status word
    pub(crate) fn reply(mut self, bytes: &[u8]) -> Self {
        self.responses.push_back(Ok(Bytes::copy_from_slice(bytes)));
        self
    }

    pub(crate) fn fail(mut self, error: TransportError) -> Self {
        self.responses.push_back(Err(error));
        self
    }

    pub(crate) fn ins(&self, index: usize) -> u8 {
        self.commands[index][1]
    }
}

impl CardTransport for MockTransport {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        self.commands.push(Bytes::copy_from_slice(command));
        self.responses
            .pop_front()
            .unwrap_or(Err(TransportError::Transmission))
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
