//! Field-by-field validation of a proposed patch against the static schema.

use fieldsync_types::{ConfigKey, ConfigValue, ValidationError, ValidationReason};

/// Fields of a patch that passed validation as a whole.
///
/// Only `validate` builds one, so holding a `ValidatedSet` means every field
/// in it has a known key, the right type and an in-range value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSet {
    fields: Vec<(ConfigKey, ConfigValue)>,
}

impl ValidatedSet {
    pub fn fields(&self) -> &[(ConfigKey, ConfigValue)] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Check every proposed field, in order, without stopping at the first
/// violation. Any violation rejects the whole set.
pub fn validate(proposed: &[(String, ConfigValue)]) -> Result<ValidatedSet, Vec<ValidationError>> {
    let mut fields = Vec::with_capacity(proposed.len());
    let mut errors = Vec::new();

    for (name, value) in proposed {
        match check_field(name, value) {
            Ok(key) => fields.push((key, *value)),
            Err(e) => errors.push(e),
        }
    }

    if errors.is_empty() {
        Ok(ValidatedSet { fields })
    } else {
        Err(errors)
    }
}

fn check_field(name: &str, value: &ConfigValue) -> Result<ConfigKey, ValidationError> {
    let key: ConfigKey = name.parse()?;
    let spec = key.spec();
    if value.kind() != spec.kind {
        return Err(ValidationError::new(name, ValidationReason::WrongType));
    }
    if !spec.domain.contains(value) {
        return Err(ValidationError::new(name, ValidationReason::OutOfRange));
    }
    Ok(key)
}
