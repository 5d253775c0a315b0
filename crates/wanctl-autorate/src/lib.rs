//! wanctl autorate — per-WAN closed-loop bufferbloat controller.
//!
//! Every cycle: measure RTT, update the baseline/load EWMAs, classify
//! congestion (four download states, three upload states), pick the
//! matching rate floors, and push them to the router's CAKE queues —
//! guarded by flash-wear skip and a write rate limiter.

pub mod classify;
pub mod controller;
pub mod health;
