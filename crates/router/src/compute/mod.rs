//! Compute-call protocol: framing, schema, and the socket client.

pub mod client;
pub mod codec;
pub mod protocol;

pub use client::{ComputeEndpoint, ComputeError, Endpoint, SocketComputeClient};
pub use codec::{read_frame, write_frame, FrameError, DEFAULT_MAX_FRAME_BYTES};
pub use protocol::{codes, ComputeFailure, ComputeRequest, ComputeResponse};
