pub mod codec;
pub mod diagnostics;
pub mod frame;
pub mod message;
pub mod types;

pub use codec::*;
pub use diagnostics::*;
pub use frame::*;
pub use message::*;
pub use types::*;
