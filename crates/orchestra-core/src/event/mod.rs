//! Workflow lifecycle event distribution.

pub mod bus;
