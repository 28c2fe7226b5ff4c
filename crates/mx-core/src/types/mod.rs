//! Unified data model: enums, instruments and accounts, orders and
//! executions, and normalized streaming messages.

pub mod enums;
pub mod instrument;
pub mod stream;
pub mod trading;

pub use enums::*;
pub use instrument::*;
pub use stream::*;
pub use trading::*;
