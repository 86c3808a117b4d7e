#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "with_sync_primitives on a shared single-thread runner may deadlock; \
         use a dedicated runner or a sequenced runner instead"
    )]
    SharedRunnerWithSyncPrimitives,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
