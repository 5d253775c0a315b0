//! wanctl steer — single cross-WAN steering authority.
//!
//! Reads the primary WAN's autorate state, measures its own RTT,
//! optionally folds in CAKE queue statistics, and toggles one
//! firewall mangle rule with strong anti-flap semantics: activation
//! after a short run of degraded samples, recovery only after a much
//! longer run of clean ones.

pub mod assess;
pub mod confidence;
pub mod daemon;
pub mod health;
