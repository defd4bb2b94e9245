pub mod clock;
pub mod futures;
