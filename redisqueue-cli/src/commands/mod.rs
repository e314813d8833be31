//! Command handlers for the redisqueue CLI

pub mod publish;
pub mod stats;
pub mod work;
