use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::domain::{sum_field, CounterField, UserId};
use storage::Storage;

/// Operator commands that work on the database directly. Running servers only push the
/// change to websocket subscribers once the record changes again through them.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/tally.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    ListRecords {
        #[arg(long, default_value = "count")]
        order_by: String,
    },
    Bump {
        user_id: i64,
        field: String,
        #[arg(allow_negative_numbers = true)]
        delta: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser {
            username,
            display_name,
            email,
        } => {
            let user_id = storage
                .create_user(&username, display_name.as_deref(), email.as_deref())
                .await?;
            println!("user_id={} username={}", user_id.0, username.trim());
        }
        Command::ListRecords { order_by } => {
            let order_by = CounterField::parse(&order_by)?;
            let records = storage.list_records(&order_by).await?;
            for record in &records {
                let values: Vec<String> = record
                    .values
                    .iter()
                    .map(|(field, value)| format!("{field}={value}"))
                    .collect();
                println!("user_id={} {}", record.user_id.0, values.join(" "));
            }
            println!(
                "{} records, total {order_by}={}",
                records.len(),
                sum_field(&records, &order_by)
            );
        }
        Command::Bump {
            user_id,
            field,
            delta,
        } => {
            let field = CounterField::parse(&field)?;
            let value = storage
                .atomic_increment(UserId(user_id), &field, delta)
                .await?;
            println!("user_id={user_id} {field}={value}");
        }
    }

    Ok(())
}
