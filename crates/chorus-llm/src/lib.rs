pub mod client;
pub mod sse;
pub mod transport;
pub mod wire;

pub mod mock;

pub use client::StreamingClient;
pub use mock::{MockReply, MockTransport};
pub use transport::{ChatTransport, FrameStream, HttpTransport};
pub use wire::ChatRequest;
