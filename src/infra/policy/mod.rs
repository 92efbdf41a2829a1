//! Policy mapping, resolution and evaluation.

mod evaluator;
mod mapping;
mod resolver;

#[cfg(test)]
pub use evaluator::MockPolicyEvaluator;
pub use evaluator::{
    DeclarativeEvaluator, Evaluation, PolicyEvaluator, VIOLATION_MISSING_ATTESTATION,
    VIOLATION_MISSING_PARAMETER, VIOLATION_UNSIGNED_ATTESTATION, VIOLATION_UNTRUSTED_BUILDER,
};
pub use mapping::{PolicyFileRef, PolicyMapping, PolicyMappings, PolicyMatch, MAPPING_FILE};
pub use resolver::{
    LocalPolicySource, PolicyBundle, PolicyFile, PolicyResolver, PolicySource, TufPolicySource,
};
