//! Built-in sample modules: a storage core, an auth layer, a repository and
//! an optional dashboard.

use std::any::Any;
use std::sync::Arc;

use serde::Deserialize;
use stagekit::{
    order, Module, ModuleId, ModuleRegistration, Phase, PhaseContext, Registrator, Registry,
    RegistryError,
};

pub const CORE: ModuleId = ModuleId::new("core");
pub const AUTH: ModuleId = ModuleId::new("auth");
pub const REPO: ModuleId = ModuleId::new("repo");
pub const DASHBOARD: ModuleId = ModuleId::new("dashboard");

/// Services registered during `ConfigureServices`.
#[derive(Debug, Default)]
pub struct ServiceCatalog(pub Vec<String>);

/// Middleware stack assembled during `ConfigureApplicationBuilder`.
#[derive(Debug, Default)]
pub struct Pipeline(pub Vec<String>);

/// Routes mapped during `ConfigureEndpoints`.
#[derive(Debug, Default)]
pub struct Routes(pub Vec<String>);

// ---------------- core ----------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CoreOptions {
    pub conn_string: String,
    pub pool_size: u32,
}

pub struct Core(Arc<CoreOptions>);

impl Module for Core {
    fn configure_builder(&self, _ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        if self.0.conn_string.is_empty() {
            anyhow::bail!("conn_string is empty");
        }
        Ok(())
    }

    fn configure_services(&self, ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        let pool = self.0.pool_size.max(1);
        ctx.resource::<ServiceCatalog>()?
            .0
            .push(format!("db-pool({}, size={pool})", self.0.conn_string));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn register_core(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register(
        ModuleRegistration::new(CORE, |o: Arc<CoreOptions>| Ok(Core(o)))
            .bind_config::<CoreOptions>()
            .require_keys(["ConnString"])
            .order(100),
    )
}

// ---------------- auth ----------------

pub struct Auth;

impl Module for Auth {
    fn configure_services(&self, ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        ctx.resource::<ServiceCatalog>()?.0.push("token-validator".into());
        Ok(())
    }

    fn configure_application_builder(&self, ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        ctx.resource::<Pipeline>()?.0.push("authenticate".into());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn register_auth(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register(
        ModuleRegistration::new(AUTH, |_: Arc<()>| Ok(Auth)).claim_dependencies(|claims| {
            // the auth tables need a slightly larger pool
            claims
                .depends_on(CORE)
                .configure_option(order::POST_CONFIG, "PoolSize", |o: &mut CoreOptions| {
                    o.pool_size = o.pool_size.max(4);
                });
            Ok(())
        }),
    )
}

// ---------------- repo ----------------

pub struct Repo;

impl Module for Repo {
    fn configure_endpoints(&self, ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        ctx.resource::<Routes>()?.0.push("GET /items".into());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn register_repo(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register(
        ModuleRegistration::new(REPO, |_: Arc<()>| Ok(Repo)).claim_dependencies(|claims| {
            let mut core = claims.depends_on(CORE);
            // fallback when the config file has no connection string
            core.configure_option(order::NORMAL, "ConnString", |o: &mut CoreOptions| {
                if o.conn_string.is_empty() {
                    o.conn_string = "sqlite::memory:".into();
                }
            });
            core.configure_phase(Phase::ConfigureServices, order::POST_CONFIG, "repo.migrations", |ctx| {
                ctx.resource::<ServiceCatalog>()?.0.push("migrations".into());
                Ok(())
            });
            Ok(())
        }),
    )
}

// ---------------- dashboard ----------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DashboardOptions {
    pub title: String,
    /// Makes endpoint mapping fail; used to exercise disable-on-exception.
    pub fail_on_start: bool,
}

pub struct Dashboard(Arc<DashboardOptions>);

impl Module for Dashboard {
    fn configure_application_builder(&self, ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        ctx.resource::<Pipeline>()?.0.push("static-files".into());
        Ok(())
    }

    fn configure_endpoints(&self, ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        if self.0.fail_on_start {
            anyhow::bail!("dashboard assets are missing");
        }
        let title = if self.0.title.is_empty() {
            "Dashboard"
        } else {
            self.0.title.as_str()
        };
        ctx.resource::<Routes>()?
            .0
            .push(format!("GET /dashboard ({title})"));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn register_dashboard(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register(
        ModuleRegistration::new(DASHBOARD, |o: Arc<DashboardOptions>| Ok(Dashboard(o)))
            .bind_config::<DashboardOptions>()
            .disable_on_exception(true)
            .claim_dependencies(|claims| {
                claims.depends_on(AUTH);
                Ok(())
            }),
    )
}

inventory::submit! { Registrator(register_core) }
inventory::submit! { Registrator(register_auth) }
inventory::submit! { Registrator(register_repo) }
inventory::submit! { Registrator(register_dashboard) }
