//! Network transport for push connections.
//!
//! Cameras connect over TCP ([`tcp`]) and send the push handshake
//! followed by `$`-interleaved RTP on the same connection. One thread
//! per connection, each owning its pipeline exclusively.

pub mod tcp;
