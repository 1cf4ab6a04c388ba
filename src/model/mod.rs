//! Data model shared by the matcher, the tape store, the replay engine and
//! the P4 interpreter.

pub mod attractor;
pub mod exchange;
pub mod headers;
pub mod mock_use;

pub use attractor::{AttractorBit, Attractors};
pub use exchange::{RequestData, ResponseData, status};
pub use headers::{HeaderEntry, Headers};
pub use mock_use::MockUse;
