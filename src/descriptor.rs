use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::MethodDescriptor;

/// Reject malformed method descriptors before they reach the instrumentor.
pub(crate) fn validate_method_descriptor(descriptor: &str) -> Result<()> {
    MethodDescriptor::from_str(descriptor)
        .map(|_| ())
        .with_context(|| format!("malformed method descriptor {descriptor:?}"))
}

/// Count parameters in a JVM method descriptor.
pub(crate) fn method_param_count(descriptor: &str) -> Result<usize> {
    let descriptor = MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    Ok(descriptor.parameter_types().len())
}
