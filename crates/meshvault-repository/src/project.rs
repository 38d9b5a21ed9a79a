//! Project repository
//!
//! Project names are unique regardless of case, unlike model content hashes
//! which may repeat.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use meshvault_cache::{cache_key, family_prefix, key_prefix};

use crate::context::RepositoryContext;
use crate::error::RepositoryError;
use crate::model::model_exists;
use crate::models::{
    normalize_name, now, to_micros, ListOptions, ListOrder, ModelRecord, NewProject, Project,
    ProjectUpdate, MODEL_COLUMNS, PROJECT_COLUMNS,
};
use crate::search::escape_like;
use crate::Result;

pub(crate) const PROJECT_FAMILY: &str = "project";

pub struct ProjectRepository {
    ctx: RepositoryContext,
}

impl ProjectRepository {
    pub fn new(ctx: RepositoryContext) -> Self {
        Self { ctx }
    }

    pub fn create(&self, project: NewProject) -> Result<String> {
        let name = normalize_name("name", &project.name)?;
        let at = now();
        let record = Project {
            id: Uuid::new_v4().to_string(),
            name,
            description: normalize_description(project.description),
            created_at: at,
            modified_at: at,
        };

        self.ctx
            .write("project.create", |tx| {
                let conn = tx.conn()?;
                ensure_name_free(&conn, &record.name, None)?;
                conn.execute(
                    &format!("INSERT INTO projects ({PROJECT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                    params![
                        record.id,
                        record.name,
                        record.description,
                        to_micros(record.created_at),
                        to_micros(record.modified_at),
                    ],
                )?;
                self.ctx
                    .invalidate_on_write(tx, vec![family_prefix(PROJECT_FAMILY)]);
                Ok(())
            })
            .map_err(|e| e.context("project.create", &record.name))?;

        tracing::info!(project_id = %record.id, name = %record.name, "Created project");
        Ok(record.id)
    }

    pub fn read(&self, id: &str) -> Result<Option<Project>> {
        let key = cache_key(PROJECT_FAMILY, id, "record");
        self.ctx
            .cached("project.read", &key, |tx| Ok(load_project(&*tx.conn()?, id)?))
            .map_err(|e| e.context("project.read", id))
    }

    /// Rename and/or re-describe a project; a rename re-checks uniqueness
    pub fn update(&self, id: &str, update: ProjectUpdate) -> Result<Project> {
        let name = update
            .name
            .as_deref()
            .map(|n| normalize_name("name", n))
            .transpose()?;
        if name.is_none() && update.description.is_none() {
            return Err(RepositoryError::validation("update", "no fields to update"));
        }

        let project = self
            .ctx
            .write("project.update", |tx| {
                let conn = tx.conn()?;
                let mut project = load_project(&conn, id)?.ok_or_else(|| RepositoryError::NotFound {
                    entity: "Project",
                    id: id.to_string(),
                })?;

                if let Some(name) = &name {
                    ensure_name_free(&conn, name, Some(id))?;
                    project.name = name.clone();
                }
                if let Some(description) = &update.description {
                    project.description = normalize_description(description.clone());
                }
                project.modified_at = now().max(project.modified_at);

                conn.execute(
                    "UPDATE projects SET name = ?2, description = ?3, modified_at = ?4 WHERE id = ?1",
                    params![
                        project.id,
                        project.name,
                        project.description,
                        to_micros(project.modified_at),
                    ],
                )?;
                self.ctx
                    .invalidate_on_write(tx, vec![family_prefix(PROJECT_FAMILY)]);
                Ok(project)
            })
            .map_err(|e| e.context("project.update", id))?;

        tracing::info!(project_id = %id, name = %project.name, "Updated project");
        Ok(project)
    }

    /// Delete a project; its models are detached, not deleted
    pub fn delete(&self, id: &str) -> Result<bool> {
        let deleted = self
            .ctx
            .write("project.delete", |tx| {
                let removed = tx.conn()?.execute("DELETE FROM projects WHERE id = ?1", [id])?;
                if removed > 0 {
                    self.ctx
                        .invalidate_on_write(tx, vec![family_prefix(PROJECT_FAMILY)]);
                }
                Ok(removed > 0)
            })
            .map_err(|e| e.context("project.delete", id))?;

        if deleted {
            tracing::info!(project_id = %id, "Deleted project");
        }
        Ok(deleted)
    }

    pub fn list(&self, options: &ListOptions) -> Result<Vec<Project>> {
        let order = match options.order {
            ListOrder::Name => "name COLLATE NOCASE ASC, id ASC",
            ListOrder::RecentlyModified => "modified_at DESC, id ASC",
            ListOrder::Created => "created_at ASC, id ASC",
        };
        let (limit, offset) = options.limit_offset();

        self.ctx.read("project.list", |tx| {
            let conn = tx.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY {order} LIMIT ?1 OFFSET ?2"
            ))?;
            let projects = stmt
                .query_map(params![limit, offset], Project::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(projects)
        })
    }

    /// Projects whose name contains `fragment`, case-insensitively
    pub fn search(&self, fragment: &str) -> Result<Vec<Project>> {
        let pattern = format!("%{}%", escape_like(&fragment.trim().to_lowercase()));
        self.ctx.read("project.search", |tx| {
            let conn = tx.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROJECT_COLUMNS} FROM projects
                 WHERE lower(name) LIKE ?1 ESCAPE '\\'
                 ORDER BY name COLLATE NOCASE, id"
            ))?;
            let projects = stmt
                .query_map([&pattern], Project::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(projects)
        })
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.read(id)?.is_some())
    }

    pub fn count(&self) -> Result<u64> {
        self.ctx.read("project.count", |tx| {
            let count: i64 = tx
                .conn()?
                .query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    /// Attach a model. Returns false if it was already attached.
    pub fn add_model(&self, project_id: &str, model_id: &str) -> Result<bool> {
        self.ctx
            .write("project.add_model", |tx| {
                let conn = tx.conn()?;
                self.ensure_project(&conn, project_id)?;
                if !model_exists(&conn, model_id)? {
                    return Err(RepositoryError::MissingModel(model_id.to_string()));
                }
                let added = conn.execute(
                    "INSERT OR IGNORE INTO project_models (project_id, model_id, added_at)
                     VALUES (?1, ?2, ?3)",
                    params![project_id, model_id, to_micros(now())],
                )?;
                if added > 0 {
                    self.ctx
                        .invalidate_on_write(tx, vec![key_prefix(PROJECT_FAMILY, project_id)]);
                }
                Ok(added > 0)
            })
            .map_err(|e| e.context("project.add_model", project_id))
    }

    /// Detach a model. Returns false if it was not attached.
    pub fn remove_model(&self, project_id: &str, model_id: &str) -> Result<bool> {
        self.ctx
            .write("project.remove_model", |tx| {
                let removed = tx.conn()?.execute(
                    "DELETE FROM project_models WHERE project_id = ?1 AND model_id = ?2",
                    params![project_id, model_id],
                )?;
                if removed > 0 {
                    self.ctx
                        .invalidate_on_write(tx, vec![key_prefix(PROJECT_FAMILY, project_id)]);
                }
                Ok(removed > 0)
            })
            .map_err(|e| e.context("project.remove_model", project_id))
    }

    /// Models attached to a project, in the order they were added
    pub fn models(&self, project_id: &str) -> Result<Vec<ModelRecord>> {
        let key = cache_key(PROJECT_FAMILY, project_id, "models");
        let models = self
            .ctx
            .cached("project.models", &key, |tx| {
                let conn = tx.conn()?;
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MODEL_COLUMNS} FROM models m
                     JOIN project_models pm ON pm.model_id = m.id
                     WHERE pm.project_id = ?1
                     ORDER BY pm.added_at, m.id"
                ))?;
                let models = stmt
                    .query_map([project_id], ModelRecord::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(Some(models))
            })
            .map_err(|e| e.context("project.models", project_id))?;
        Ok(models.unwrap_or_default())
    }

    fn ensure_project(&self, conn: &Connection, id: &str) -> Result<()> {
        let found = conn
            .query_row("SELECT 1 FROM projects WHERE id = ?1", [id], |_| Ok(()))
            .optional()?;
        match found {
            Some(()) => Ok(()),
            None => Err(RepositoryError::NotFound {
                entity: "Project",
                id: id.to_string(),
            }),
        }
    }
}

impl Clone for ProjectRepository {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

fn load_project(conn: &Connection, id: &str) -> Result<Option<Project>> {
    Ok(conn
        .query_row(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
            [id],
            Project::from_row,
        )
        .optional()?)
}

/// Fail with `Duplicate` if another project already uses `name`
fn ensure_name_free(conn: &Connection, name: &str, except_id: Option<&str>) -> Result<()> {
    let taken: Option<String> = conn
        .query_row(
            "SELECT id FROM projects WHERE name = ?1 COLLATE NOCASE AND id IS NOT ?2",
            params![name, except_id],
            |row| row.get(0),
        )
        .optional()?;
    match taken {
        Some(_) => Err(RepositoryError::Duplicate {
            entity: "project",
            key: name.to_string(),
        }),
        None => Ok(()),
    }
}

fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing;
    use crate::model::ModelRepository;
    use crate::models::NewModel;

    fn setup() -> (ProjectRepository, ModelRepository) {
        let ctx = testing::context();
        (ProjectRepository::new(ctx.clone()), ModelRepository::new(ctx))
    }

    #[test]
    fn test_create_and_read() {
        let (projects, _) = setup();
        let id = projects
            .create(NewProject::new(" Castle ").with_description("Medieval set"))
            .unwrap();

        let project = projects.read(&id).unwrap().unwrap();
        assert_eq!(project.name, "Castle");
        assert_eq!(project.description.as_deref(), Some("Medieval set"));
        assert!(projects.exists(&id).unwrap());
        assert_eq!(projects.count().unwrap(), 1);
    }

    #[test]
    fn test_names_are_unique_ignoring_case() {
        let (projects, _) = setup();
        projects.create(NewProject::new("Castle")).unwrap();
        let err = projects.create(NewProject::new("CASTLE")).unwrap_err();
        assert!(matches!(err, RepositoryError::Duplicate { entity: "project", .. }));
    }

    #[test]
    fn test_rename_rechecks_uniqueness() {
        let (projects, _) = setup();
        projects.create(NewProject::new("Castle")).unwrap();
        let id = projects.create(NewProject::new("Village")).unwrap();

        let err = projects
            .update(&id, ProjectUpdate {
                name: Some("castle".into()),
                ..ProjectUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Duplicate { .. }));

        // Changing only the case of its own name is allowed
        let renamed = projects
            .update(&id, ProjectUpdate {
                name: Some("VILLAGE".into()),
                description: Some(Some("Houses".into())),
            })
            .unwrap();
        assert_eq!(renamed.name, "VILLAGE");
        assert_eq!(projects.read(&id).unwrap().unwrap().description.as_deref(), Some("Houses"));
    }

    #[test]
    fn test_models_membership() {
        let (projects, models) = setup();
        let project = projects.create(NewProject::new("Kit")).unwrap();
        let a = models
            .create(NewModel::new("A", "/a.stl", "aaa", 1, "stl"))
            .unwrap();
        let b = models
            .create(NewModel::new("B", "/b.stl", "bbb", 1, "stl"))
            .unwrap();

        assert!(projects.add_model(&project, &a).unwrap());
        assert!(!projects.add_model(&project, &a).unwrap());
        assert!(projects.add_model(&project, &b).unwrap());
        assert_eq!(projects.models(&project).unwrap().len(), 2);

        assert!(projects.remove_model(&project, &a).unwrap());
        let remaining = projects.models(&project).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, b);

        // Deleting a model detaches it everywhere
        models.delete(&b).unwrap();
        assert!(projects.models(&project).unwrap().is_empty());

        assert!(matches!(
            projects.add_model(&project, "ghost"),
            Err(RepositoryError::MissingModel(_))
        ));
        assert!(matches!(
            projects.add_model("ghost", &a),
            Err(RepositoryError::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_keeps_models() {
        let (projects, models) = setup();
        let project = projects.create(NewProject::new("Temp")).unwrap();
        let model = models
            .create(NewModel::new("A", "/a.stl", "aaa", 1, "stl"))
            .unwrap();
        projects.add_model(&project, &model).unwrap();

        assert!(projects.delete(&project).unwrap());
        assert!(projects.read(&project).unwrap().is_none());
        assert!(models.exists(&model).unwrap());
    }

    #[test]
    fn test_search_and_list() {
        let (projects, _) = setup();
        for name in ["Space Station", "space shuttle", "Forest"] {
            projects.create(NewProject::new(name)).unwrap();
        }

        let found: Vec<String> = projects
            .search("SPACE")
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(found, vec!["space shuttle", "Space Station"]);

        let listed = projects.list(&ListOptions::default()).unwrap();
        assert_eq!(listed[0].name, "Forest");
        assert_eq!(listed.len(), 3);
    }

    #[test]
    fn test_search_treats_wildcards_literally() {
        let (projects, _) = setup();
        for name in ["50% scale", "500 parts", "rev_a", "reva"] {
            projects.create(NewProject::new(name)).unwrap();
        }

        let names = |fragment: &str| -> Vec<String> {
            projects
                .search(fragment)
                .unwrap()
                .into_iter()
                .map(|p| p.name)
                .collect()
        };
        assert_eq!(names("50%"), vec!["50% scale"]);
        assert_eq!(names("rev_"), vec!["rev_a"]);
        assert_eq!(names("%").len(), 1);
    }
}
