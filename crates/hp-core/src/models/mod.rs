pub mod host;
pub mod reservation;
pub mod snapshot;

pub use host::ShareableHost;
pub use reservation::{
    Reservation, ReservationState, ReservationTarget, ReservationTask, WorkloadItem,
};
pub use snapshot::{fingerprint, ExecutorIdentity, HostDefinition, Snapshot};
