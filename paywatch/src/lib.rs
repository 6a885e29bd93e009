//! Paywatch
//!
//! Blockchain monitor for the payment platform, based on the [Abscissa]
//! framework. It watches the configured chains for deposits to addresses of
//! outstanding payment requests, tracks confirmations, and records outbound
//! notification events for the delivery service to pick up.
//!
//! [Abscissa]: https://github.com/iqlusioninc/abscissa

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unused_lifetimes,
    unused_qualifications
)]

pub mod application;
mod cli;
mod commands;
mod components;
pub mod config;
mod error;
mod model;
mod prelude;
mod store;
mod task;
