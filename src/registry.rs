use crate::{
    cache::HostnameCache,
    dns,
    resources::{
        Edition,
        GameServer,
        GameServerSpec,
        DOMAIN_ANNOTATION,
        EDITION_LABEL,
        SUBDOMAIN_ANNOTATION,
        USER_ID_LABEL,
        UUID_LABEL,
    },
};
use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use kube::{
    api::{
        Api,
        DeleteParams,
        ListParams,
        ObjectMeta,
        PostParams,
    },
    ResourceExt,
};
use sqlx::PgPool;
use std::{
    collections::BTreeMap,
    sync::Arc,
};
use thiserror::Error;
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";
const NAME_CONSTRAINT: &str = "games_name_key";
const ADDRESS_CONSTRAINT: &str = "games_address_key";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("game not found")]
    NotFound,

    #[error("game name {0:?} is already taken")]
    NameTaken(String),

    #[error("subdomain {0:?} is already taken")]
    SubdomainTaken(String),

    #[error("subdomain {0:?} is not a valid dns name")]
    InvalidSubdomain(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("game {id} is registered but the cluster create failed")]
    ClusterCreate {
        id: Uuid,
        #[source]
        source: kube::Error,
    },

    #[error("game {name:?} was unregistered but the cluster delete failed")]
    ClusterDelete {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("game server rejected by the cluster")]
    Rejected(#[source] kube::Error),
}

/// Whether a game currently has a server process behind it. Stored as a
/// registry column and refreshed from the cluster on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    On,
    Off,
}

impl GameState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameState::On => "ON",
            GameState::Off => "OFF",
        }
    }

    /// A server that is starting up or serving players counts as on; absent
    /// and shutting-down servers count as off.
    pub fn of(gs: Option<&GameServer>) -> Self {
        match gs {
            Some(gs) if gs.is_starting() || gs.is_online() => GameState::On,
            _ => GameState::Off,
        }
    }
}

impl std::fmt::Display for GameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for GameState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "ON" => Ok(GameState::On),
            "OFF" => Ok(GameState::Off),
            other => Err(format!("unknown game state: {other:?}")),
        }
    }
}

/// One row of the games registry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Game {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    /// Public hostname the game is reachable at, unique across all games.
    pub address: String,
    #[sqlx(try_from = "String")]
    pub edition: Edition,
    #[sqlx(try_from = "String")]
    pub state: GameState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a new game needs before it can be registered and scheduled.
#[derive(Debug, Clone)]
pub struct NewGame {
    pub user_id: Uuid,
    pub name: String,
    pub edition: Edition,
    pub custom_subdomain: Option<String>,
}

/// Cluster-side game server operations the registry drives. Kept behind a
/// trait so the transactional logic can be exercised without a cluster.
#[async_trait]
pub trait GameServerApi: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<GameServer>, kube::Error>;

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<GameServer>, kube::Error>;

    async fn create(&self, gs: &GameServer) -> Result<(), kube::Error>;

    /// Server-side dry run, exercising admission without persisting.
    async fn create_dry_run(&self, gs: &GameServer) -> Result<(), kube::Error>;

    async fn delete(&self, name: &str) -> Result<(), kube::Error>;
}

pub struct KubeGameServers {
    api: Api<GameServer>,
}

impl KubeGameServers {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl GameServerApi for KubeGameServers {
    async fn get(&self, name: &str) -> Result<Option<GameServer>, kube::Error> {
        match self.api.get(name).await {
            Ok(gs) => Ok(Some(gs)),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<GameServer>, kube::Error> {
        let params = ListParams::default().labels(&format!("{USER_ID_LABEL}={user_id}"));
        Ok(self.api.list(&params).await?.items)
    }

    async fn create(&self, gs: &GameServer) -> Result<(), kube::Error> {
        self.api.create(&PostParams::default(), gs).await?;
        Ok(())
    }

    async fn create_dry_run(&self, gs: &GameServer) -> Result<(), kube::Error> {
        let params = PostParams {
            dry_run: true,
            ..Default::default()
        };
        self.api.create(&params, gs).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), kube::Error> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Keeps the games registry, the cluster, and the hostname cache agreeing
/// about which games exist and whether they are running.
pub struct RegistryService<A> {
    pool: PgPool,
    servers: A,
    hostnames: Arc<HostnameCache>,
    domain: String,
    template: GameServerSpec,
}

impl<A: GameServerApi> RegistryService<A> {
    pub fn new(pool: PgPool, servers: A, hostnames: Arc<HostnameCache>, domain: String, template: GameServerSpec) -> Self {
        Self {
            pool,
            servers,
            hostnames,
            domain,
            template,
        }
    }

    /// Registers a game and schedules its server. The registry row commits
    /// before the cluster create: an orphaned row is cheap to clean up, an
    /// orphaned server is not.
    pub async fn create(&self, new: NewGame) -> Result<Game, RegistryError> {
        validate_subdomain(new.custom_subdomain.as_deref())?;
        let resource_name = resource_name(new.user_id, &new.name);
        let address = self.address_for(&resource_name, new.custom_subdomain.as_deref());

        // The informer-backed cache rejects taken hostnames without touching
        // the database; the unique constraint remains the authority.
        if self.hostnames.contains(&address) {
            return Err(RegistryError::SubdomainTaken(address));
        }

        let id = Uuid::new_v4();
        let gs = self.game_server(id, &new, &resource_name);
        let mut tx = self.pool.begin().await?;

        // Fail fast on taken names; the unique constraints close the race
        // the precheck cannot.
        let taken: Option<(String,)> = sqlx::query_as("SELECT name FROM games WHERE name = $1 OR address = $2 FOR UPDATE")
            .bind(&new.name)
            .bind(&address)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some((existing,)) = taken {
            return Err(if existing == new.name {
                RegistryError::NameTaken(new.name)
            } else {
                RegistryError::SubdomainTaken(address)
            });
        }

        let game: Game = sqlx::query_as(
            "INSERT INTO games (id, user_id, name, address, edition, state, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, now(), now()) \
             RETURNING *",
        )
        .bind(id)
        .bind(new.user_id)
        .bind(&new.name)
        .bind(&address)
        .bind(new.edition.as_str())
        .bind(GameState::Off.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| classify_unique_violation(err, &new.name, &address))?;

        tx.commit().await?;
        info!(%id, user_id = %new.user_id, name = %new.name, "game registered");

        if let Err(err) = self.servers.create(&gs).await {
            error!(%id, "cluster create failed for registered game: {err}");
            return Err(RegistryError::ClusterCreate { id, source: err });
        }
        info!(%id, resource = %resource_name, "game server scheduled");

        Ok(game)
    }

    /// Validates a prospective game against the cluster's admission chain
    /// without registering or scheduling anything.
    pub async fn create_dry_run(&self, new: NewGame) -> Result<(), RegistryError> {
        validate_subdomain(new.custom_subdomain.as_deref())?;
        let resource_name = resource_name(new.user_id, &new.name);
        let address = self.address_for(&resource_name, new.custom_subdomain.as_deref());
        if self.hostnames.contains(&address) {
            return Err(RegistryError::SubdomainTaken(address));
        }

        let gs = self.game_server(Uuid::new_v4(), &new, &resource_name);
        self.servers.create_dry_run(&gs).await.map_err(RegistryError::Rejected)
    }

    /// Unregisters a game and deletes its server. The row is gone once the
    /// transaction commits; a failed cluster delete surfaces so the caller
    /// can retry it.
    pub async fn delete(&self, user_id: Uuid, name: &str) -> Result<(), RegistryError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM games WHERE user_id = $1 AND name = $2 FOR UPDATE")
            .bind(user_id)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        let Some((id,)) = row else {
            return Err(RegistryError::NotFound);
        };

        sqlx::query("DELETE FROM games WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(%id, %user_id, name, "game unregistered");

        let resource = resource_name(user_id, name);
        if let Err(err) = self.servers.delete(&resource).await {
            error!(%id, resource = %resource, "cluster delete failed for unregistered game: {err}");
            return Err(RegistryError::ClusterDelete {
                name: name.to_string(),
                source: err,
            });
        }

        Ok(())
    }

    /// A single game scoped to its owner, with its stored state refreshed
    /// from the cluster.
    pub async fn get_for_user(&self, user_id: Uuid, name: &str) -> Result<Game, RegistryError> {
        let mut tx = self.pool.begin().await?;

        let game: Option<Game> = sqlx::query_as("SELECT * FROM games WHERE user_id = $1 AND name = $2 FOR UPDATE")
            .bind(user_id)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        let mut game = game.ok_or(RegistryError::NotFound)?;

        let gs = self.servers.get(&resource_name(user_id, name)).await.unwrap_or_else(|err| {
            warn!(%user_id, name, "cluster lookup failed, serving stored state: {err}");
            None
        });
        // A server resource only counts if the owner labels line up. When no
        // live server is found the stored state stands as-is.
        let owned = gs.filter(|gs| gs.user_id() == Some(user_id.to_string().as_str()));
        if let Some(gs) = owned {
            let live = GameState::of(Some(&gs));
            if live != game.state {
                game = update_state(&mut tx, game.id, live).await?;
            }
        }
        tx.commit().await?;

        Ok(game)
    }

    /// All games owned by a user, each refreshed against a single cluster
    /// list call.
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Game>, RegistryError> {
        let mut tx = self.pool.begin().await?;

        let games: Vec<Game> = sqlx::query_as("SELECT * FROM games WHERE user_id = $1 ORDER BY created_at FOR UPDATE")
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await?;

        let servers = self.servers.list_for_user(user_id).await.unwrap_or_else(|err| {
            warn!(%user_id, "cluster list failed, serving stored state: {err}");
            Vec::new()
        });

        let mut refreshed = Vec::with_capacity(games.len());
        for mut game in games {
            let resource = resource_name(user_id, &game.name);
            if let Some(gs) = servers.iter().find(|gs| gs.name_any() == resource) {
                let live = GameState::of(Some(gs));
                if live != game.state {
                    game = update_state(&mut tx, game.id, live).await?;
                }
            }
            refreshed.push(game);
        }
        tx.commit().await?;

        Ok(refreshed)
    }

    fn address_for(&self, resource_name: &str, custom_subdomain: Option<&str>) -> String {
        let subdomain = custom_subdomain.unwrap_or(resource_name);
        format!("{subdomain}.{}", self.domain.trim_end_matches('.'))
    }

    fn game_server(&self, id: Uuid, new: &NewGame, resource_name: &str) -> GameServer {
        let mut annotations = BTreeMap::from([(DOMAIN_ANNOTATION.to_string(), self.domain.clone())]);
        if let Some(subdomain) = &new.custom_subdomain {
            annotations.insert(SUBDOMAIN_ANNOTATION.to_string(), subdomain.clone());
        }
        let labels = BTreeMap::from([
            (USER_ID_LABEL.to_string(), new.user_id.to_string()),
            (EDITION_LABEL.to_string(), new.edition.to_string()),
            (UUID_LABEL.to_string(), id.to_string()),
        ]);

        GameServer {
            metadata: ObjectMeta {
                name: Some(resource_name.to_string()),
                annotations: Some(annotations),
                labels: Some(labels),
                ..Default::default()
            },
            spec: self.template.clone(),
            status: None,
        }
    }
}

/// Cluster resource name for a game, unique per user and game name.
pub fn resource_name(user_id: Uuid, name: &str) -> String {
    format!("{user_id}.{name}")
}

/// A requested subdomain becomes both the unique `address` column and the
/// `agones-mc/customSubdomain` annotation, so it must be a valid relative
/// dns name before anything is written.
fn validate_subdomain(subdomain: Option<&str>) -> Result<(), RegistryError> {
    match subdomain {
        Some(s) if s.ends_with('.') || !dns::is_dns_name(s) => {
            Err(RegistryError::InvalidSubdomain(s.to_string()))
        }
        _ => Ok(()),
    }
}

async fn update_state(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    state: GameState,
) -> Result<Game, sqlx::Error> {
    sqlx::query_as("UPDATE games SET state = $2, updated_at = now() WHERE id = $1 RETURNING *")
        .bind(id)
        .bind(state.as_str())
        .fetch_one(&mut **tx)
        .await
}

/// Maps the unique-constraint race the pre-checks cannot close.
fn classify_unique_violation(err: sqlx::Error, name: &str, address: &str) -> RegistryError {
    let constraint = match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            db.constraint().map(str::to_string)
        }
        _ => None,
    };
    match constraint.as_deref() {
        Some(NAME_CONSTRAINT) => RegistryError::NameTaken(name.to_string()),
        Some(ADDRESS_CONSTRAINT) => RegistryError::SubdomainTaken(address.to_string()),
        _ => RegistryError::Database(err),
    }
}
