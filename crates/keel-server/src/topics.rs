//! Current value of each topic, pushed to a client when it subscribes and
//! re-broadcast after a tool that affects the topic runs.
//!
//! Snapshots are built from the same [`StateEvent`] variants the managers
//! publish, so a subscriber sees one payload shape per topic.

use keel_core::session::Session;
use keel_core::{KeelError, StateEvent, Topic};
use keel_engine::context;
use keel_engine::Services;
use keel_store::RealityRepo;

/// The event describing `topic`'s present state, or `None` when the topic
/// has no standing value (no active session, nothing recorded yet, or a
/// topic that only carries transient notifications).
pub fn snapshot(services: &Services, topic: Topic) -> Result<Option<StateEvent>, KeelError> {
    match topic {
        Topic::SessionStatus => {
            let session = services.sessions.active_session()?;
            Ok(Some(StateEvent::SessionStatusChanged {
                session: session.map(Box::new),
                previous: None,
                warning: None,
            }))
        }
        Topic::ContextStatus => {
            let Some(session) = services.sessions.active_session()? else {
                return Ok(None);
            };
            let status = context::load_status(&services.db, &session.id)?;
            Ok(Some(StateEvent::ContextStatusChanged(Box::new(status))))
        }
        Topic::RealityChecks => {
            let latest = services.db.with_conn(RealityRepo::latest)?;
            Ok(latest.map(|s| StateEvent::RealityCheckCompleted(Box::new(s))))
        }
        Topic::ProjectStatus | Topic::ProjectVelocity | Topic::DocumentationStatus => {
            let Some(session) = services.sessions.active_session()? else {
                return Ok(None);
            };
            project_snapshot(services, &session, topic)
        }
        Topic::ToolExecution | Topic::AdvisorySuggestions => Ok(None),
    }
}

fn project_snapshot(
    services: &Services,
    session: &Session,
    topic: Topic,
) -> Result<Option<StateEvent>, KeelError> {
    let report = services.projects.get_project_status(&session.project)?;
    let event = match topic {
        Topic::ProjectStatus => StateEvent::ProjectUpdated(Box::new(report.project)),
        Topic::ProjectVelocity => StateEvent::VelocityRecorded {
            project: report.project.name,
            points: report.velocity,
        },
        _ => StateEvent::DocumentationChanged {
            project_id: report.project.id,
            documents: report.documents,
        },
    };
    Ok(Some(event))
}
