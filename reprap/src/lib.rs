pub mod command;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod flavor;
pub mod job;
pub mod line_history;
pub mod pipeline;
pub mod position;
pub mod queues;
pub mod send_loop;
pub mod send_token;
pub mod state;
pub mod temperature;
pub mod timers;
pub mod transport;

pub use command::{Command, CommandBody, QueueEntry};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use job::{FileJob, Job, MemoryJob};
pub use state::{ProtocolState, StateChange};
pub use transport::{MockFirmware, MockTransport, SerialTransport, SerialTransportConfig, Transport};
