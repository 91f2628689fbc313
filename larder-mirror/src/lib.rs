//! Locally-mirrored Git repositories and the machinery that keeps them
//! serviceable: an explicit clone lifecycle, coordinated fetches with ref
//! freshness checks, and a response spool that lets the first wave of
//! clients share one upstream response while a clone is still running.

#![cfg_attr(not(test), warn(clippy::unwrap_used))]

pub mod repository;
pub mod spool;

pub use repository::{Repositories, Repository, State};
pub use spool::{RepoSpools, Spool};
