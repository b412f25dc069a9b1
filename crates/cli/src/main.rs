//! Coursecart CLI - Database migrations and support tooling.
//!
//! # Usage
//!
//! ```bash
//! # Run storefront database migrations
//! cc-cli migrate
//!
//! # Show a user's cart as JSON
//! cc-cli cart show <uid>
//!
//! # Empty a user's cart
//! cc-cli cart clear <uid>
//!
//! # List a user's orders
//! cc-cli orders list <uid>
//! ```
//!
//! # Commands
//!
//! - `migrate` - Run database migrations
//! - `cart show` / `cart clear` - Inspect or reset a remote cart
//! - `orders list` - Order history of a user

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "cc-cli")]
#[command(author, version, about = "Coursecart CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Inspect or reset a user's cart
    Cart {
        #[command(subcommand)]
        action: CartAction,
    },
    /// Inspect a user's orders
    Orders {
        #[command(subcommand)]
        action: OrdersAction,
    },
}

#[derive(Subcommand)]
enum CartAction {
    /// Print the cart as JSON
    Show {
        /// User id the cart is keyed by
        uid: String,
    },
    /// Empty the cart
    Clear {
        /// User id the cart is keyed by
        uid: String,
    },
}

#[derive(Subcommand)]
enum OrdersAction {
    /// List orders, oldest first
    List {
        /// User id the orders belong to
        uid: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::storefront().await?,
        Commands::Cart { action } => match action {
            CartAction::Show { uid } => commands::cart::show(&uid).await?,
            CartAction::Clear { uid } => commands::cart::clear(&uid).await?,
        },
        Commands::Orders { action } => match action {
            OrdersAction::List { uid, json } => commands::orders::list(&uid, json).await?,
        },
    }
    Ok(())
}
