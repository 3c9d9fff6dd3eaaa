//! rollcall-store — Persistent state: enrolled identities and attendance.
//!
//! [`EnrollmentStore`] keeps reference images in a directory and the
//! identity registry in memory. [`AttendanceLedger`] is the append-only CSV
//! record of who was present on which day.

pub mod ledger;
pub mod registry;

pub use ledger::{AttendanceLedger, AttendanceRecord, LedgerError, RecordOutcome};
pub use registry::{
    EnrollImage, EnrollmentOutcome, EnrollmentStore, FailureReason, ImageFailure, ReloadReport,
    StoreError,
};
