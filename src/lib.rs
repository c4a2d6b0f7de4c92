//! MobileSync Backup Engine
//!
//! Reads finished iOS backup archives (both the binary Manifest.mbdb and
//! the SQLite Manifest.db generations) behind one index API, discovers and
//! validates backup directories, and drives live device backups over the
//! mobilebackup2 wire protocol.

pub mod device;
pub mod discover;
pub mod error;
pub mod frame;
pub mod fsutil;
pub mod handlers;
pub mod index;
pub mod logger;
pub mod mbdb;
pub mod message;
pub mod session;
pub mod transport;
