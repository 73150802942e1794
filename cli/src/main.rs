mod api;
mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process;
use std::sync::Arc;

use crate::api::ApiClient;
use crate::commands::{
    ItemArgs, PlanFields, ProfileArgs, cmd_chat, cmd_login, cmd_logout, cmd_macros,
    cmd_plan_add_item, cmd_plan_create, cmd_plan_delete, cmd_plan_list, cmd_plan_show,
    cmd_plan_sync, cmd_plan_update, cmd_profile, cmd_track_done, cmd_track_note, cmd_track_notes,
    cmd_track_show, cmd_track_undo, parse_macros_per_100,
};
use crate::config::{Config, TokenStore};
use fittrack_core::db::Database;
use fittrack_core::meal_plans::{CacheConfig, MealPlanService, ReconcilePolicy};
use fittrack_core::nutrition::NutritionService;
use fittrack_core::tracking::DailyTracker;

#[derive(Parser)]
#[command(
    name = "fittrack",
    version,
    about = "Meal plans, macro targets, and a coaching chatbot from the terminal"
)]
struct Cli {
    /// Backend base URL (default: $FITTRACK_API_URL or http://127.0.0.1:8000)
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// Keep plans created offline when a fresh list arrives from the server
    #[arg(long, global = true)]
    keep_local_only: bool,
    /// Reject list responses that are a single plan object instead of a list
    #[arg(long, global = true)]
    strict_envelopes: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the API token used for every request
    Login {
        /// Bearer token issued by the backend
        #[arg(long)]
        token: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget the stored API token
    Logout {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Talk to the nutrition coach (interactive when no message is given)
    Chat {
        /// Message to send
        message: Option<String>,
        /// Wait for the whole reply instead of streaming it
        #[arg(long)]
        no_stream: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage meal plans
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Calculate daily calorie and macro targets
    Macros {
        /// Age in years
        #[arg(long)]
        age: u32,
        /// male or female
        #[arg(long)]
        sex: String,
        /// Height in cm
        #[arg(long)]
        height: f64,
        /// Weight in kg
        #[arg(long)]
        weight: f64,
        /// sedentary, light, moderate, active, very_active
        #[arg(long, default_value = "moderate")]
        activity: String,
        /// lose, maintain, gain
        #[arg(long, default_value = "maintain")]
        goal: String,
        /// Protein percentage (requires --carbs and --fat, must sum to 100)
        #[arg(long)]
        protein: Option<i32>,
        /// Carbs percentage (requires --protein and --fat, must sum to 100)
        #[arg(long)]
        carbs: Option<i32>,
        /// Fat percentage (requires --protein and --carbs, must sum to 100)
        #[arg(long)]
        fat: Option<i32>,
        /// Calculate on this device without contacting the server
        #[arg(long)]
        local: bool,
        /// Remember this profile on this device
        #[arg(long)]
        save: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show your nutrition profile
    Profile {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Tick off planned meals and keep daily notes
    Track {
        #[command(subcommand)]
        command: TrackCommands,
    },
}

#[derive(Subcommand)]
enum PlanCommands {
    /// List meal plans
    List {
        /// Only active plans
        #[arg(long, conflicts_with = "inactive")]
        active: bool,
        /// Only inactive plans
        #[arg(long)]
        inactive: bool,
        /// Show what is saved on this device without contacting the server
        #[arg(long)]
        offline: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a meal plan and its items
    Show {
        /// Plan ID
        id: String,
        /// Include per-day totals for the week
        #[arg(long)]
        week: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a meal plan
    Create {
        /// Plan name
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Mark the plan active
        #[arg(long)]
        active: bool,
        /// Daily calorie target
        #[arg(long)]
        calories: Option<f64>,
        /// Daily protein target (g)
        #[arg(long)]
        protein: Option<f64>,
        /// Daily carbs target (g)
        #[arg(long)]
        carbs: Option<f64>,
        /// Daily fat target (g)
        #[arg(long)]
        fat: Option<f64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change a meal plan
    Update {
        /// Plan ID
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, conflicts_with = "clear_description")]
        description: Option<String>,
        /// Remove the description
        #[arg(long)]
        clear_description: bool,
        /// Set whether the plan is active (true/false)
        #[arg(long)]
        active: Option<bool>,
        #[arg(long)]
        calories: Option<f64>,
        #[arg(long)]
        protein: Option<f64>,
        #[arg(long)]
        carbs: Option<f64>,
        #[arg(long)]
        fat: Option<f64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a meal plan
    Delete {
        /// Plan ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a meal to a plan
    AddItem {
        /// Plan ID
        id: String,
        /// monday-sunday or mon-sun
        #[arg(long)]
        day: String,
        /// breakfast, brunch, lunch, snack, dinner, other
        #[arg(short, long)]
        meal: String,
        /// Meal or ingredient reference
        #[arg(long)]
        meal_id: String,
        /// Display name for the meal
        #[arg(long)]
        name: Option<String>,
        /// Amount, in --unit
        #[arg(short, long)]
        quantity: f64,
        /// Unit of --quantity (default: g)
        #[arg(long)]
        unit: Option<String>,
        /// Calories per 100 units
        #[arg(long)]
        calories: Option<f64>,
        /// Protein per 100 units
        #[arg(long)]
        protein: Option<f64>,
        /// Carbs per 100 units
        #[arg(long)]
        carbs: Option<f64>,
        /// Fat per 100 units
        #[arg(long)]
        fat: Option<f64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Upload plans that were saved while the server was unreachable
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TrackCommands {
    /// Mark a planned meal as eaten
    Done {
        /// Meal type
        meal: String,
        /// Meal reference as used in the plan
        meal_id: String,
        /// Date (YYYY-MM-DD, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Unmark a meal
    Undo {
        /// Meal type
        meal: String,
        /// Meal reference as used in the plan
        meal_id: String,
        /// Date (YYYY-MM-DD, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Save a calorie note for a day (empty text clears it)
    Note {
        text: String,
        /// Date (YYYY-MM-DD, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List every day that has a note
    Notes {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show planned vs. eaten for a day
    Show {
        /// Date (YYYY-MM-DD, default: today)
        date: Option<String>,
        /// Plan ID (default: first active plan)
        #[arg(long)]
        plan: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("FITTRACK_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| "error".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.api_url)?;
    let tokens = Arc::new(TokenStore::load(&config.token_path)?);
    let cache_config = CacheConfig {
        accept_single_object: !cli.strict_envelopes,
        reconcile: if cli.keep_local_only {
            ReconcilePolicy::KeepLocalOnly
        } else {
            ReconcilePolicy::ReplaceWithRemote
        },
        ..CacheConfig::default()
    };
    let api = || ApiClient::new(&config.api_url, Arc::clone(&tokens));
    let plans = || -> Result<_> {
        Ok(MealPlanService::with_config(
            api()?,
            Database::open(&config.db_path)?,
            cache_config.clone(),
        ))
    };

    match cli.command {
        Commands::Login { token, json } => cmd_login(&tokens, &token, json),
        Commands::Logout { json } => cmd_logout(&tokens, json),
        Commands::Chat {
            message,
            no_stream,
            json,
        } => cmd_chat(api()?, message, no_stream, json).await,
        Commands::Plan { command } => {
            let svc = plans()?;
            match command {
                PlanCommands::List {
                    active,
                    inactive,
                    offline,
                    json,
                } => {
                    let filter = match (active, inactive) {
                        (true, _) => Some(true),
                        (_, true) => Some(false),
                        _ => None,
                    };
                    cmd_plan_list(&svc, filter, offline, json).await
                }
                PlanCommands::Show { id, week, json } => cmd_plan_show(&svc, &id, week, json).await,
                PlanCommands::Create {
                    name,
                    description,
                    active,
                    calories,
                    protein,
                    carbs,
                    fat,
                    json,
                } => {
                    let fields = PlanFields {
                        name: Some(name),
                        description,
                        active: Some(active),
                        calories,
                        protein,
                        carbs,
                        fat,
                    };
                    cmd_plan_create(&svc, fields, json).await
                }
                PlanCommands::Update {
                    id,
                    name,
                    description,
                    clear_description,
                    active,
                    calories,
                    protein,
                    carbs,
                    fat,
                    json,
                } => {
                    let fields = PlanFields {
                        name,
                        description,
                        active,
                        calories,
                        protein,
                        carbs,
                        fat,
                    };
                    cmd_plan_update(&svc, &id, fields, clear_description, json).await
                }
                PlanCommands::Delete { id, json } => cmd_plan_delete(&svc, &id, json).await,
                PlanCommands::AddItem {
                    id,
                    day,
                    meal,
                    meal_id,
                    name,
                    quantity,
                    unit,
                    calories,
                    protein,
                    carbs,
                    fat,
                    json,
                } => {
                    let args = ItemArgs {
                        day,
                        meal,
                        meal_id,
                        meal_name: name,
                        quantity,
                        unit,
                        per_100: parse_macros_per_100(calories, protein, carbs, fat)?,
                    };
                    cmd_plan_add_item(&svc, &id, args, json).await
                }
                PlanCommands::Sync { json } => cmd_plan_sync(&svc, json).await,
            }
        }
        Commands::Macros {
            age,
            sex,
            height,
            weight,
            activity,
            goal,
            protein,
            carbs,
            fat,
            local,
            save,
            json,
        } => {
            let svc = NutritionService::new(
                api()?,
                Database::open(&config.db_path)?,
                cache_config.remote_timeout,
            );
            let args = ProfileArgs {
                age,
                sex,
                height,
                weight,
                activity,
                goal,
                protein,
                carbs,
                fat,
            };
            cmd_macros(&svc, args, local, save, json).await
        }
        Commands::Profile { json } => {
            let svc = NutritionService::new(
                api()?,
                Database::open(&config.db_path)?,
                cache_config.remote_timeout,
            );
            cmd_profile(&svc, json).await
        }
        Commands::Track { command } => {
            let tracker = DailyTracker::new(Database::open(&config.db_path)?);
            match command {
                TrackCommands::Done {
                    meal,
                    meal_id,
                    date,
                    json,
                } => cmd_track_done(&tracker, &meal, &meal_id, date, json),
                TrackCommands::Undo {
                    meal,
                    meal_id,
                    date,
                    json,
                } => cmd_track_undo(&tracker, &meal, &meal_id, date, json),
                TrackCommands::Note { text, date, json } => {
                    cmd_track_note(&tracker, &text, date, json)
                }
                TrackCommands::Notes { json } => cmd_track_notes(&tracker, json),
                TrackCommands::Show { date, plan, json } => {
                    let svc = plans()?;
                    cmd_track_show(&svc, &tracker, plan.as_deref(), date, json).await
                }
            }
        }
    }
}
