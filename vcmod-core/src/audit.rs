//! Audit logging of mutating calls.
//!
//! Every call that changes server state goes through [`AuditLogger`]. The
//! event is emitted under the `audit` tracing target and kept in an
//! in-memory trail for the lifetime of the invocation.

use std::sync::Mutex;

use serde::Serialize;

use crate::value::MoRef;

/// Endpoint surface a mutation was sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    Soap,
    Pbm,
    Sms,
    Vsan,
    Rest,
    Mob,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub surface: Surface,
    /// Method name, HTTP verb or MOB action.
    pub operation: String,
    /// Managed object, REST path or file URL.
    pub target: String,
}

pub struct AuditLogger {
    component: String,
    trail: Mutex<Vec<AuditRecord>>,
}

impl AuditLogger {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            trail: Mutex::new(Vec::new()),
        }
    }

    /// Create a logger with no component label (for testing)
    pub fn new_noop() -> Self {
        Self::new("")
    }

    fn log(&self, surface: Surface, operation: &str, target: String) {
        tracing::info!(
            target: "audit",
            component = %self.component,
            surface = ?surface,
            operation = %operation,
            object = %target,
            "mutating call"
        );
        let record = AuditRecord {
            surface,
            operation: operation.to_string(),
            target,
        };
        match self.trail.lock() {
            Ok(mut trail) => trail.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }

    // === Managed-object calls ===

    pub fn method_invoked(&self, surface: Surface, this: &MoRef, method: &str) {
        self.log(surface, method, this.to_string());
    }

    // === REST calls ===

    pub fn rest_call(&self, verb: &str, path: &str) {
        self.log(Surface::Rest, verb, path.to_string());
    }

    // === Global permissions ===

    pub fn global_permission(&self, action: &str, principal: &str) {
        self.log(Surface::Mob, action, principal.to_string());
    }

    // === Datastore and firmware files ===

    pub fn file_transfer(&self, verb: &str, url: &str) {
        self.log(Surface::File, verb, url.to_string());
    }

    pub fn trail(&self) -> Vec<AuditRecord> {
        match self.trail.lock() {
            Ok(trail) => trail.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn mutation_count(&self) -> usize {
        match self.trail.lock() {
            Ok(trail) => trail.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trail_records_in_order() {
        let audit = AuditLogger::new_noop();
        audit.method_invoked(Surface::Soap, &MoRef::new("Folder", "group-h4"), "CreateClusterEx");
        audit.rest_call("POST", "/cis/tagging/tag");
        let trail = audit.trail();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].operation, "CreateClusterEx");
        assert_eq!(trail[0].target, "Folder:group-h4");
        assert_eq!(trail[1].surface, Surface::Rest);
        assert_eq!(audit.mutation_count(), 2);
    }
}
