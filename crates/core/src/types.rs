/// Job primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Robot identities are opaque strings (UUID v4 when auto-generated).
pub type RobotId = String;

/// Generate a fresh robot identity.
pub fn generate_robot_id() -> RobotId {
    uuid::Uuid::new_v4().to_string()
}
