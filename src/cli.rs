//! Command-line surface. Prompts and printing live here, never in the core.

use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tabled::{Table, Tabled};

use crate::config::Config;
use crate::error::Error;
use crate::fleet::{Fleet, NewContainer};
use crate::prefs::{Preferences, PROJECT_ID, REMOTE_ADDRESS};
use crate::replicator::{Confirm, Replicator};
use crate::runtime::{DesiredState, NspawnRuntime};
use crate::ssh::SshClient;
use crate::store::SshStore;
use crate::types::{parse_ports, Container, Machine, MachineAddr, Project};

#[derive(Debug, Parser)]
#[command(name = "nspawnctl", version, about = "systemd-nspawn deployment across a fleet")]
pub struct Cli {
    /// Bootstrap machine, [USER="root"@]HOST[:PORT=22].
    #[arg(long, short = 'r', global = true, env = "NSPAWNCTL_REMOTE_ADDRESS")]
    remote_address: Option<String>,

    /// Log remote commands.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Answer yes to removal confirmations.
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read or write local preferences.
    #[command(subcommand)]
    Config(ConfigCommand),
    #[command(flatten)]
    Fleet(FleetCommand),
}

/// Commands that load and save the cluster state.
#[derive(Debug, Subcommand)]
enum FleetCommand {
    /// Start a new cluster on the bootstrap machine.
    Init,
    /// Manage machines.
    #[command(subcommand)]
    Machine(MachineCommand),
    /// Manage projects.
    #[command(subcommand)]
    Project(ProjectCommand),
    /// Manage containers.
    Container(ContainerArgs),
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Get { section: String, key: String },
    Set { section: String, key: String, value: String },
}

#[derive(Debug, Subcommand)]
enum MachineCommand {
    /// List machines.
    List,
    /// Add machine.
    Add {
        /// [USER="root"@]HOST[:PORT=22]
        #[arg(long, short = 'a')]
        address: String,
    },
    /// Remove machine.
    Remove {
        #[arg(long = "id", short = 'I')]
        id: String,
    },
}

#[derive(Debug, Subcommand)]
enum ProjectCommand {
    /// List projects.
    List,
    /// Add project.
    Add {
        #[arg(long, short = 'n')]
        name: String,
    },
    /// Remove project.
    Remove {
        #[arg(long = "id", short = 'I')]
        id: String,
    },
}

#[derive(Debug, Args)]
struct ContainerArgs {
    /// Project id; defaults to the stored preference.
    #[arg(long, short = 'P')]
    project_id: Option<String>,

    #[command(subcommand)]
    command: ContainerCommand,
}

#[derive(Debug, Subcommand)]
enum ContainerCommand {
    /// List containers of the project.
    List,
    /// Add container.
    Add(AddContainerArgs),
    /// Remove container.
    Remove {
        #[arg(long = "id", short = 'I')]
        id: String,
        /// Try removing it from every machine.
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Start container.
    Start {
        #[arg(long = "id", short = 'I')]
        id: String,
    },
    /// Stop container.
    Stop {
        #[arg(long = "id", short = 'I')]
        id: String,
    },
    /// Restart container.
    Restart {
        #[arg(long = "id", short = 'I')]
        id: String,
    },
    /// Move container to another machine (not implemented).
    Migrate {
        #[arg(long = "id", short = 'I')]
        id: String,
    },
}

#[derive(Debug, Args)]
struct AddContainerArgs {
    /// Human readable name.
    #[arg(long, short = 'n')]
    name: String,
    /// MACHINE_PORT:CONTAINER_PORT[,M_PORT:C_PORT,...]
    #[arg(long, short = 'p', default_value = "22")]
    ports: String,
    /// Linux distribution.
    #[arg(long, short = 'd', default_value = "arch")]
    distro: String,
    #[arg(long, short = 'I')]
    image_id: Option<String>,
    #[arg(long, short = 'i')]
    image: Option<String>,
    /// Machine to create the container on.
    #[arg(long, short = 'M')]
    machine_id: Option<String>,
    /// Start the container once created.
    #[arg(long, short = 's')]
    start: bool,
}

/// Asks on the terminal; declines when stdin is not a terminal.
struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, question: &str) -> bool {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return false;
        }
        eprint!("{question} [y/n]: ");
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if stdin.lock().read_line(&mut answer).is_err() {
            return false;
        }
        answer.trim().eq_ignore_ascii_case("y")
    }
}

impl Cli {
    pub async fn run(self, config: Config) -> Result<()> {
        let mut prefs = Preferences::load(&config.prefs_path)?;

        match self.command {
            Command::Config(command) => run_config(&mut prefs, command),
            Command::Fleet(command) => {
                let bootstrap: MachineAddr = prefs
                    .or_default(self.remote_address, REMOTE_ADDRESS)?
                    .parse()?;
                let fleet = build_fleet(&config, bootstrap);
                run_fleet(&fleet, &prefs, command, self.yes).await
            }
        }
    }
}

fn run_config(prefs: &mut Preferences, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Get { section, key } => match prefs.get(&section, &key) {
            Some(value) => println!("{value}"),
            None => anyhow::bail!("{section}.{key} is not set in {}", prefs.path().display()),
        },
        ConfigCommand::Set {
            section,
            key,
            value,
        } => prefs.set(&section, &key, &value)?,
    }
    Ok(())
}

async fn run_fleet(fleet: &Fleet, prefs: &Preferences, command: FleetCommand, yes: bool) -> Result<()> {
    match command {
        FleetCommand::Init => {
            let m = fleet.init().await?;
            println!("{} {}", m.id.short(), m.addr());
        }
        FleetCommand::Machine(MachineCommand::List) => {
            let rows: Vec<MachineRow> = fleet.machines().await?.iter().map(MachineRow::from).collect();
            print_table(&rows, "machines");
        }
        FleetCommand::Machine(MachineCommand::Add { address }) => {
            let m = fleet.add_machine(&address).await?;
            println!("{} {}", m.id.short(), m.addr());
        }
        FleetCommand::Machine(MachineCommand::Remove { id }) => {
            confirm_removal(yes, "machine")?;
            let m = fleet.remove_machine(&id).await?;
            println!("{}", m.id.short());
        }
        FleetCommand::Project(ProjectCommand::List) => {
            let rows: Vec<ProjectRow> = fleet.projects().await?.iter().map(ProjectRow::from).collect();
            print_table(&rows, "projects");
        }
        FleetCommand::Project(ProjectCommand::Add { name }) => {
            let p = fleet.add_project(&name).await?;
            println!("{} {}", p.id.short(), p.name);
        }
        FleetCommand::Project(ProjectCommand::Remove { id }) => {
            confirm_removal(yes, "project")?;
            let p = fleet.remove_project(&id).await?;
            println!("{}", p.id.short());
        }
        FleetCommand::Container(args) => {
            let project = prefs.or_default(args.project_id, PROJECT_ID)?;
            run_container(fleet, &project, args.command, yes).await?;
        }
    }
    Ok(())
}

async fn run_container(fleet: &Fleet, project: &str, command: ContainerCommand, yes: bool) -> Result<()> {
    match command {
        ContainerCommand::List => {
            let rows: Vec<ContainerRow> = fleet
                .containers(project)
                .await?
                .iter()
                .map(ContainerRow::from)
                .collect();
            print_table(&rows, "containers");
        }
        ContainerCommand::Add(args) => {
            let spec = NewContainer {
                name: args.name,
                ports: parse_ports(&args.ports)?,
                distro: args.distro,
                image_id: args.image_id,
                image: args.image,
                machine: args.machine_id,
                start: args.start,
            };
            let c = fleet.add_container(project, spec).await?;
            println!("{} {} {}", c.id.short(), c.host, render_ports(&c));
        }
        ContainerCommand::Remove { id, force } => {
            confirm_removal(yes, "container")?;
            let c = fleet.remove_container(project, &id, force).await?;
            println!("{}", c.id.short());
        }
        ContainerCommand::Start { id } => {
            fleet.set_running(project, &id, DesiredState::Running).await?;
        }
        ContainerCommand::Stop { id } => {
            fleet.set_running(project, &id, DesiredState::Stopped).await?;
        }
        ContainerCommand::Restart { id } => {
            fleet.set_running(project, &id, DesiredState::Restarted).await?;
        }
        ContainerCommand::Migrate { id } => {
            fleet.migrate(project, &id).await?;
        }
    }
    Ok(())
}

fn build_fleet(config: &Config, bootstrap: MachineAddr) -> Fleet {
    let client = SshClient::new(config.ssh_binary.clone(), config.connect_timeout());
    let store = SshStore::new(
        client.clone(),
        config.state_path.clone(),
        config.command_timeout(),
    );
    let runtime = NspawnRuntime::new(client, config.nspawn_settings());
    let replicator = Replicator::new(
        Arc::new(store),
        config.on_unreachable,
        Arc::new(TerminalConfirm),
    );
    Fleet::new(replicator, Arc::new(runtime), bootstrap)
}

fn confirm_removal(yes: bool, what: &str) -> Result<(), Error> {
    if yes || TerminalConfirm.confirm(&format!("Are you sure you want to remove {what}?")) {
        Ok(())
    } else {
        Err(Error::Aborted)
    }
}

/// `host:container` pairs ordered by container port.
fn render_ports(container: &Container) -> String {
    let mut pairs: Vec<(&u16, &u16)> = container.ports.iter().collect();
    pairs.sort_by_key(|(host, guest)| (**guest, **host));
    pairs
        .iter()
        .map(|(host, guest)| format!("{host}:{guest}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Tabled)]
struct MachineRow {
    #[tabled(rename = "MACHINE_ID")]
    id: String,
    #[tabled(rename = "ADDRESS")]
    address: String,
}

impl From<&Machine> for MachineRow {
    fn from(m: &Machine) -> Self {
        Self {
            id: m.id.short().to_string(),
            address: m.addr().to_string(),
        }
    }
}

#[derive(Tabled)]
struct ProjectRow {
    #[tabled(rename = "PROJECT_ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
}

impl From<&Project> for ProjectRow {
    fn from(p: &Project) -> Self {
        Self {
            id: p.id.short().to_string(),
            name: p.name.clone(),
        }
    }
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "CONTAINER_ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "ADDRESS")]
    host: String,
    #[tabled(rename = "PORTS")]
    ports: String,
}

impl From<&Container> for ContainerRow {
    fn from(c: &Container) -> Self {
        Self {
            id: c.id.short().to_string(),
            name: c.name.clone(),
            host: c.host.clone(),
            ports: render_ports(c),
        }
    }
}

fn print_table<T: Tabled>(rows: &[T], what: &str) {
    if rows.is_empty() {
        println!("No {what} found.");
    } else {
        println!("{}", Table::new(rows));
    }
}

/// Exit status for a failed command.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<Error>().map_or(1, Error::exit_code)
}
