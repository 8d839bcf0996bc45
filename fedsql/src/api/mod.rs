//! HTTP surface: request binding, tenant/auth resolution, and translation
//! of engine results into wire responses.

pub mod handlers;
