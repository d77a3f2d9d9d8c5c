pub mod db;
pub mod encryption;
pub mod logging;
