/// PostgreSQL persistence for jobs and execution logs.
///
/// [`PostgresJobStore`] implements both storage traits over the
/// `jobgate_jobs` and `jobgate_execution_logs` tables created by the
/// migrations in `jobgate/migrations`.
pub mod postgres;

pub use postgres::PostgresJobStore;
