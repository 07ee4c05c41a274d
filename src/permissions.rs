//! Recursive ownership and mode fixes.
//!
//! Copies made under the elevated shell into the engine's own private storage
//! end up owned by root; this resolves the owner of the destination and applies
//! it (plus mode 771) recursively with the primitives of the active resolver.

use log::{info, warn};

use crate::command_runner::{CommandRunner, run_reporting};
use crate::error::OwnershipError;
use crate::error_sink::ErrorSink;
use crate::ownership::{DEFAULT_DIR_MODE, OwnershipResolver};
use crate::types::{CommandBatch, Ownership, Privilege};

pub struct PermissionApplier<'a> {
    resolver: &'a dyn OwnershipResolver,
    runner: &'a dyn CommandRunner,
}

impl<'a> PermissionApplier<'a> {
    pub fn new(resolver: &'a dyn OwnershipResolver, runner: &'a dyn CommandRunner) -> Self {
        Self { resolver, runner }
    }

    /// Resolve the owner of `path` and apply it recursively.
    ///
    /// Returns the number of failed steps (0 or 1). A failed lookup is returned
    /// as `Err` before anything is changed.
    pub fn apply(&self, sink: &ErrorSink, path: &str) -> Result<u32, OwnershipError> {
        let ownership = self
            .resolver
            .resolve(self.runner, sink, path, Privilege::Elevated)?;
        Ok(self.apply_ownership(sink, &ownership, path))
    }

    /// Apply an already resolved ownership
    pub fn apply_ownership(&self, sink: &ErrorSink, ownership: &Ownership, path: &str) -> u32 {
        let mut batch = CommandBatch::elevated();
        for command in self
            .resolver
            .permission_commands(ownership, path, DEFAULT_DIR_MODE)
        {
            batch.push(command);
        }
        let status = run_reporting(self.runner, &batch, sink, path);
        info!("set permissions on {} returned {}", path, status);
        u32::from(status != 0)
    }

    /// [`apply`](Self::apply) with a lookup failure recorded in `sink` and counted as one failure
    pub fn set_permissions(&self, sink: &ErrorSink, path: &str) -> u32 {
        match self.apply(sink, path) {
            Ok(failures) => failures,
            Err(e) => {
                warn!("error while setting permissions: {}", e);
                sink.report(
                    "",
                    &format!("setPermissions error: could not find permissions for {}", path),
                );
                1
            }
        }
    }
}
