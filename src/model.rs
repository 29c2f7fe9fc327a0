pub use self::{amount::*, events::*};

pub mod amount;
pub mod events;
