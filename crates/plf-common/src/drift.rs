//! Configuration drift detection
//!
//! Compares the naming snapshot recorded when cloud resources were created
//! against the one derived from the current configuration. Pure comparison;
//! the caller decides what to do with a [`Drift`].

use std::fmt;

/// A value that can be compared field by field.
pub trait Snapshot: fmt::Display {
    /// Named fields in a stable order. `None` means the field is unset.
    fn fields(&self) -> Vec<(&'static str, Option<String>)>;
}

/// One field that differs between the two snapshots
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDrift {
    pub field: &'static str,
    pub configured: Option<String>,
    pub recorded: Option<String>,
}

/// Outcome of [`check`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriftCheck {
    Ok,
    Drift(Vec<FieldDrift>),
}

/// Drift between configured and recorded snapshots, rendered with both
/// sides so the operator can pick which one to keep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Drift {
    pub fields: Vec<FieldDrift>,
    pub configured: String,
    pub recorded: String,
}

impl Drift {
    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.field).collect()
    }
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "configuration drift detected in: {}",
            self.field_names().join(", ")
        )?;
        writeln!(f, "  configured: {}", self.configured)?;
        writeln!(f, "  recorded:   {}", self.recorded)?;
        for field in &self.fields {
            writeln!(
                f,
                "  {}: configured={} recorded={}",
                field.field,
                field.configured.as_deref().unwrap_or("(unset)"),
                field.recorded.as_deref().unwrap_or("(unset)"),
            )?;
        }
        write!(
            f,
            "refusing to continue; restore the recorded configuration or run cleanup first"
        )
    }
}

impl std::error::Error for Drift {}

/// Compare two snapshots field by field.
pub fn check<S: Snapshot>(configured: &S, recorded: &S) -> DriftCheck {
    let recorded_fields = recorded.fields();
    let drifted: Vec<FieldDrift> = configured
        .fields()
        .into_iter()
        .zip(recorded_fields)
        .filter(|((_, a), (_, b))| a != b)
        .map(|((field, configured), (_, recorded))| FieldDrift {
            field,
            configured,
            recorded,
        })
        .collect();

    if drifted.is_empty() {
        DriftCheck::Ok
    } else {
        DriftCheck::Drift(drifted)
    }
}

/// [`check`], turned into an error carrying both snapshots.
pub fn ensure_consistent<S: Snapshot>(configured: &S, recorded: &S) -> Result<(), Drift> {
    match check(configured, recorded) {
        DriftCheck::Ok => Ok(()),
        DriftCheck::Drift(fields) => Err(Drift {
            fields,
            configured: configured.to_string(),
            recorded: recorded.to_string(),
        }),
    }
}
