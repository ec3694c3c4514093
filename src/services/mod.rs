pub mod backup_service;
pub mod catalog;
pub mod diff;
pub mod downloader;
pub mod error;
pub mod ledger;
pub mod lister;
pub mod persister;
pub mod progress;
pub mod regions;
pub mod remote;
pub mod resolver;
pub mod retry;
pub mod runs;
