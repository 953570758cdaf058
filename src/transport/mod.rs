pub mod local;
pub mod tcp;
