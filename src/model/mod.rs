//! §3 data model: the agent message, its enumerations, tenant
//! normalization, and the validation result that every strategy in the
//! pipeline produces.

pub mod message;
pub mod tenant;
pub mod validation_result;
