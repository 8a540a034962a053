//! Ticket intake — turns support email into helpdesk tickets.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod tickets;
