//! Main entry point for Paywatch

#![deny(warnings, missing_docs, trivial_casts, unused_qualifications)]
#![forbid(unsafe_code)]

/// Boot Paywatch
fn main() {
    paywatch::application::boot();
}
