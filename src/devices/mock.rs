//! Scripted SPS30 stand-in for tests.
//!
//! Replies are consumed in order; every command is recorded in an event log
//! that can be shared with a fake clock to check how commands and pauses
//! interleave.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use super::shdlc::{Result, ShdlcError, ShdlcPort};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Command(u8, Vec<u8>),
    Pause(Duration),
}

pub type EventLog = Rc<RefCell<Vec<Event>>>;

#[derive(Debug, Clone)]
pub enum Reply {
    Data(Vec<u8>),
    Timeout,
    Protocol,
    DeviceState(u8),
}

impl Reply {
    pub fn data(bytes: Vec<u8>) -> Self {
        Reply::Data(bytes)
    }

    pub fn empty() -> Self {
        Reply::Data(Vec::new())
    }
}

pub struct MockSps30 {
    replies: VecDeque<Reply>,
    log: EventLog,
}

impl MockSps30 {
    pub fn new() -> Self {
        Self::with_log(EventLog::default())
    }

    pub fn with_log(log: EventLog) -> Self {
        MockSps30 {
            replies: VecDeque::new(),
            log,
        }
    }

    pub fn push(&mut self, reply: Reply) {
        self.replies.push_back(reply);
    }

    pub fn log(&self) -> EventLog {
        Rc::clone(&self.log)
    }

    pub fn commands(&self) -> Vec<(u8, Vec<u8>)> {
        self.log
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Command(command, data) => Some((*command, data.clone())),
                Event::Pause(_) => None,
            })
            .collect()
    }
}

impl ShdlcPort for MockSps30 {
    fn execute(&mut self, command: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.log
            .borrow_mut()
            .push(Event::Command(command, data.to_vec()));

        // An exhausted script behaves like a silent device.
        match self.replies.pop_front().unwrap_or(Reply::Timeout) {
            Reply::Data(bytes) => Ok(bytes),
            Reply::Timeout => Err(ShdlcError::Timeout {
                command,
                timeout: Duration::from_millis(500),
            }),
            Reply::Protocol => Err(ShdlcError::Protocol("scripted decode failure".to_string())),
            Reply::DeviceState(code) => Err(ShdlcError::DeviceState { command, code }),
        }
    }
}
