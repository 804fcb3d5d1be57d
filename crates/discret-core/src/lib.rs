pub mod access;
pub mod codes;
pub mod emergency;
pub mod monitor;
pub mod notify;
pub mod obfuscate;
pub mod realtime;
pub mod verify;
