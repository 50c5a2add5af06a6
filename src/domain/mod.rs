mod aggregate;
mod bill;
mod money;
mod share;

pub use aggregate::*;
pub use bill::*;
pub use money::*;
pub use share::*;
