//! Call negotiation for peer-to-peer audio/video sessions.
//!
//! See [`calls`] for the building blocks and [`calls::CallManager`] for the
//! entry point most applications need.

pub mod calls;
