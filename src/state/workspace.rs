use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::{State, StateError, StateTxn};
use crate::codec::Versioned;
use crate::job::ApplicationRef;
use crate::keys::Bucket;

/// Activity summary of a workspace, kept up to date by operation writes.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Workspace {
    pub name: String,
    pub active_time_ms: i64,
    pub projects: Vec<WorkspaceProject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct WorkspaceProject {
    pub project: String,
    pub active_time_ms: i64,
    pub applications: Vec<WorkspaceApplication>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct WorkspaceApplication {
    pub name: String,
    pub active_time_ms: i64,
}

impl Versioned for Workspace {
    const VERSION: u8 = 1;
}

impl Workspace {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            active_time_ms: 0,
            projects: Vec::new(),
        }
    }

    /// Move the workspace, project and application activity times forward to `at`.
    fn touch(&mut self, app: &ApplicationRef, at: i64) {
        self.active_time_ms = self.active_time_ms.max(at);

        let pos = self
            .projects
            .iter()
            .position(|p| p.project.eq_ignore_ascii_case(&app.project));
        let project = match pos {
            Some(i) => &mut self.projects[i],
            None => {
                self.projects.push(WorkspaceProject {
                    project: app.project.clone(),
                    active_time_ms: 0,
                    applications: Vec::new(),
                });
                let last = self.projects.len() - 1;
                &mut self.projects[last]
            }
        };
        project.active_time_ms = project.active_time_ms.max(at);

        match project
            .applications
            .iter_mut()
            .find(|a| a.name.eq_ignore_ascii_case(&app.application))
        {
            Some(a) => a.active_time_ms = a.active_time_ms.max(at),
            None => project.applications.push(WorkspaceApplication {
                name: app.application.clone(),
                active_time_ms: at,
            }),
        }
    }
}

impl StateTxn<'_> {
    pub(crate) async fn touch_workspace(
        &mut self,
        name: &str,
        app: &ApplicationRef,
        at: i64,
    ) -> Result<(), StateError> {
        if name.is_empty() {
            return Ok(());
        }
        let mut ws = self
            .get::<Workspace>(Bucket::Workspaces, name)
            .await?
            .unwrap_or_else(|| Workspace::new(name));
        ws.touch(app, at);
        self.put(Bucket::Workspaces, name, &ws)
    }
}

impl State {
    /// Workspace by case-insensitive name.
    pub async fn workspace_get(&self, name: &str) -> Result<Workspace, StateError> {
        self.get_durable::<Workspace>(Bucket::Workspaces, name)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("workspace {}", name)))
    }

    pub async fn workspace_list(&self) -> Result<Vec<Workspace>, StateError> {
        Ok(self
            .scan_bucket::<Workspace>(Bucket::Workspaces)
            .await?
            .into_iter()
            .map(|(_, ws)| ws)
            .collect())
    }
}
