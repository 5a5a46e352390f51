pub mod deploy;
pub mod kinds;
