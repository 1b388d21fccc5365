use anyhow::Context;
use blockhost_db::entities::servers;
use blockhost_model::{MinecraftServer, ServerVersion, VersionType};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, QueryOrder, Set};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Created(MinecraftServer),
    Updated(MinecraftServer),
    Deleted(Uuid),
}

/// The server catalogue.
pub struct ServerRepository {
    db: DatabaseConnection,
    updates: broadcast::Sender<ServerEvent>,
}

fn from_model(m: servers::Model) -> anyhow::Result<MinecraftServer> {
    let ty: VersionType = m
        .version_type
        .parse()
        .with_context(|| format!("server {} has a bad version type", m.uuid))?;
    let version = ServerVersion::parse(&m.version, ty)
        .with_context(|| format!("server {} has a bad version", m.uuid))?;
    Ok(MinecraftServer {
        uuid: m.uuid,
        name: m.name,
        version,
        runner_uuid: m.runner_uuid,
        creation_time: m.created_at.with_timezone(&Utc),
    })
}

impl ServerRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self { db, updates }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.updates.subscribe()
    }

    fn publish(&self, event: ServerEvent) {
        // no subscribers is fine
        let _ = self.updates.send(event);
    }

    pub async fn create(&self, server: &MinecraftServer) -> anyhow::Result<()> {
        let model = servers::ActiveModel {
            uuid: Set(server.uuid),
            name: Set(server.name.clone()),
            version: Set(server.version.render()),
            version_type: Set(server.version.version_type().to_string()),
            runner_uuid: Set(server.runner_uuid),
            created_at: Set(server.creation_time.into()),
        };
        servers::Entity::insert(model)
            .exec_without_returning(&self.db)
            .await
            .with_context(|| format!("insert server {}", server.uuid))?;
        self.publish(ServerEvent::Created(server.clone()));
        Ok(())
    }

    pub async fn get(&self, uuid: Uuid) -> anyhow::Result<Option<MinecraftServer>> {
        servers::Entity::find_by_id(uuid)
            .one(&self.db)
            .await
            .context("load server")?
            .map(from_model)
            .transpose()
    }

    pub async fn all(&self) -> anyhow::Result<Vec<MinecraftServer>> {
        let rows = servers::Entity::find()
            .order_by_asc(servers::Column::CreatedAt)
            .all(&self.db)
            .await
            .context("list servers")?;
        rows.into_iter().map(from_model).collect()
    }

    /// `None` when no such server exists.
    pub async fn rename(&self, uuid: Uuid, name: &str) -> anyhow::Result<Option<MinecraftServer>> {
        let Some(row) = servers::Entity::find_by_id(uuid)
            .one(&self.db)
            .await
            .context("load server")?
        else {
            return Ok(None);
        };
        let mut active: servers::ActiveModel = row.into();
        active.name = Set(name.to_string());
        let row = active
            .update(&self.db)
            .await
            .with_context(|| format!("rename server {uuid}"))?;
        let server = from_model(row)?;
        self.publish(ServerEvent::Updated(server.clone()));
        Ok(Some(server))
    }

    pub async fn delete(&self, uuid: Uuid) -> anyhow::Result<bool> {
        let res = servers::Entity::delete_by_id(uuid)
            .exec(&self.db)
            .await
            .with_context(|| format!("delete server {uuid}"))?;
        let deleted = res.rows_affected > 0;
        if deleted {
            self.publish(ServerEvent::Deleted(uuid));
        }
        Ok(deleted)
    }
}

#[cfg(test)]
pub(crate) async fn test_db(dir: &std::path::Path) -> DatabaseConnection {
    use sea_orm_migration::MigratorTrait;

    let url = format!("sqlite://{}?mode=rwc", dir.join("blockhost.db").display());
    let db = blockhost_db::connect(&url).await.unwrap();
    blockhost_migration::Migrator::up(&db, None).await.unwrap();
    db
}
