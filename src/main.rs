use anyhow::{bail, Context, Result};
use chrono::{Duration, TimeZone, Utc};
use std::env;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bitemporal_registry::{
    Actor, AttributeSnapshot, AttributeTrack, Change, EngineConfig, EntityId, EntityKind,
    Interval, PageFilter, Paginator, RegistrationReader, RegistrationTimeline, SqliteStore,
    ValidityResolver,
};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("bitemporal_registry=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config()?;
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("demo") => run_demo(&config),
        Some("history") => {
            let id = args.get(2).context("usage: bitemporal-registry history <entity-uuid>")?;
            run_history(&config, id)
        }
        Some("list") => run_list(&config),
        _ => {
            eprintln!("bitemporal-registry {}", bitemporal_registry::VERSION);
            eprintln!("usage: bitemporal-registry <demo | history <entity-uuid> | list>");
            std::process::exit(2);
        }
    }
}

/// `REGISTRY_CONFIG` points at a TOML file; `REGISTRY_*` variables override it
fn load_config() -> Result<EngineConfig> {
    let config = match env::var("REGISTRY_CONFIG") {
        Ok(path) => EngineConfig::load(Path::new(&path))
            .with_context(|| format!("loading config from {path}"))?,
        Err(_) => EngineConfig::default(),
    };
    config.apply_env().context("applying REGISTRY_* overrides")
}

fn open_store(config: &EngineConfig) -> Result<SqliteStore> {
    match &config.database_path {
        Some(path) => SqliteStore::open(path)
            .with_context(|| format!("opening database {}", path.display())),
        None => SqliteStore::open_in_memory().context("opening in-memory database"),
    }
}

fn run_demo(config: &EngineConfig) -> Result<()> {
    println!("Bitemporal Registry - demo");
    println!("--------------------------------------------");

    let timeline = RegistrationTimeline::with_config(open_store(config)?, config)?;
    let now = Utc::now();
    let since = Utc
        .with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
        .single()
        .context("building demo date")?;

    println!("\n1. Creating organisation unit...");
    let unit = EntityId::new();
    timeline.create(
        unit,
        EntityKind::OrganisationUnit,
        Change::new(
            vec![
                AttributeSnapshot::org_unit("hr", "Human Resources"),
                AttributeSnapshot::Parent { parent: None },
            ],
            Interval::starting_at(since),
            Actor::new("demo"),
        )
        .with_note("initial import"),
        now,
    )?;
    let team = EntityId::new();
    timeline.create(
        team,
        EntityKind::OrganisationUnit,
        Change::new(
            vec![
                AttributeSnapshot::org_unit("hr-payroll", "Payroll"),
                AttributeSnapshot::Parent { parent: Some(unit) },
            ],
            Interval::starting_at(since),
            Actor::new("demo"),
        ),
        now,
    )?;
    println!("   created {unit} with child {team}");

    println!("\n2. Renaming it from 2023 on...");
    let renamed_from = Utc
        .with_ymd_and_hms(2023, 1, 1, 0, 0, 0)
        .single()
        .context("building demo date")?;
    timeline.update(
        unit,
        Change::new(
            vec![AttributeSnapshot::org_unit("hr", "People & Culture")],
            Interval::starting_at(renamed_from),
            Actor::new("demo"),
        ),
        now + Duration::milliseconds(1),
    )?;

    let resolver = ValidityResolver::new(timeline.reader());
    for row in resolver.validities(unit, AttributeTrack::Properties, Interval::unbounded(), None)? {
        println!("   [{}, {}) {:?}", row.validity.from(), row.validity.to(), row.value);
    }

    println!("   ancestors of {team}: {:?}", resolver.ancestors(team, Utc::now(), None)?);

    println!("\n3. Moving the child's start to 2021...");
    let moved_from = Utc
        .with_ymd_and_hms(2021, 1, 1, 0, 0, 0)
        .single()
        .context("building demo date")?;
    timeline.set_bounds(team, Interval::starting_at(moved_from), Actor::new("demo"), now + Duration::milliseconds(2))?;
    for row in resolver.active_validities(team, Interval::unbounded(), None)? {
        println!("   [{}, {}) {:?}", row.validity.from(), row.validity.to(), row.value);
    }

    println!("\n4. Paging all properties...");
    let paginator = Paginator::new(timeline.reader(), config);
    let filter = PageFilter::new(AttributeTrack::Properties);
    let (items, cursor) = paginator.open(&filter, config.default_page_size, now + Duration::seconds(1))?;
    println!("   {} item(s), cursor {}", items.len(), cursor.encode()?);

    println!("\n--------------------------------------------");
    run_history_for(&resolver, unit)
}

fn run_history(config: &EngineConfig, id: &str) -> Result<()> {
    let id: EntityId = id.parse().with_context(|| format!("'{id}' is not a UUID"))?;
    let store = open_store(config)?;
    let resolver = ValidityResolver::new(&store);
    run_history_for(&resolver, id)
}

fn run_history_for(resolver: &ValidityResolver<'_>, id: EntityId) -> Result<()> {
    let registrations = resolver.registrations(id)?;
    if registrations.is_empty() {
        bail!("no registrations for {id}");
    }

    println!("Registrations of {id}:");
    for reg in registrations {
        println!(
            "  [{}, {}) {:<10} by {}{}",
            reg.tx_validity.from(),
            reg.tx_validity.to(),
            reg.lifecycle.as_str(),
            reg.actor,
            reg.note.map(|n| format!(" ({n})")).unwrap_or_default()
        );
    }
    Ok(())
}

fn run_list(config: &EngineConfig) -> Result<()> {
    let store = open_store(config)?;
    let ids = store.entity_ids(None)?;
    println!("{} entit{}", ids.len(), if ids.len() == 1 { "y" } else { "ies" });
    for id in ids {
        println!("  {id}");
    }
    Ok(())
}
