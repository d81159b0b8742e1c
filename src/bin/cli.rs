use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "farm-cli")]
#[command(about = "CLI for a running farm_sync server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, env = "FARM_SYNC_URL", default_value = "http://localhost:11111")]
    url: String,
}

#[derive(Subcommand)]
enum Commands {
    Health,
    /// Print the aggregate dashboard state
    Dashboard,
    /// Force a full dashboard refresh
    Refresh,
    /// Read one collection, e.g. `query tasks --filter status=pending --order-by due_date --ascending`
    Query {
        table: String,
        /// column=value equality filter
        #[arg(short, long)]
        filter: Option<String>,
        #[arg(short, long)]
        order_by: Option<String>,
        #[arg(short, long)]
        ascending: bool,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Comma-separated columns
        #[arg(short, long)]
        select: Option<String>,
    },
    AddField {
        #[arg(short, long)]
        name: String,
        #[arg(short = 'L', long)]
        location: String,
        #[arg(short, long)]
        size: f64,
        #[arg(short, long)]
        crop_type: String,
        #[arg(long, default_value = "healthy", value_parser = ["healthy", "warning", "critical"])]
        status: String,
        #[arg(long, default_value_t = 50.0)]
        soil_moisture: f64,
        #[arg(long, default_value_t = 50.0)]
        sunlight: f64,
        #[arg(long, default_value = "Early")]
        growth_stage: String,
    },
    SetUserStatus {
        #[arg(short, long)]
        id: String,
        #[arg(short, long, value_parser = ["active", "inactive"])]
        status: String,
    },
    UpdateTaskStatus {
        #[arg(short, long)]
        id: String,
        #[arg(short, long, value_parser = ["pending", "in-progress", "completed", "cancelled"])]
        status: String,
    },
    DeleteTask {
        #[arg(short, long)]
        id: String,
    },
    MarkRead {
        #[arg(short, long)]
        id: String,
    },
    ClearNotifications {
        #[arg(short, long)]
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let url = cli.url.trim_end_matches('/');

    let request = match cli.command {
        Commands::Health => client.get(format!("{}/health", url)),
        Commands::Dashboard => client.get(format!("{}/dashboard", url)),
        Commands::Refresh => client.post(format!("{}/dashboard/refresh", url)),
        Commands::Query { table, filter, order_by, ascending, limit, select } => {
            let mut params: Vec<(&str, String)> = Vec::new();
            if let Some(filter) = filter {
                let (column, value) = filter
                    .split_once('=')
                    .ok_or("--filter expects column=value")?;
                params.push(("filter_column", column.to_string()));
                params.push(("filter_value", value.to_string()));
            }
            if let Some(order_by) = order_by {
                params.push(("order_by", order_by));
                params.push(("ascending", ascending.to_string()));
            }
            if let Some(limit) = limit {
                params.push(("limit", limit.to_string()));
            }
            if let Some(select) = select {
                params.push(("select", select));
            }
            client.get(format!("{}/collections/{}", url, table)).query(&params)
        }
        Commands::AddField {
            name,
            location,
            size,
            crop_type,
            status,
            soil_moisture,
            sunlight,
            growth_stage,
        } => client.post(format!("{}/fields", url)).json(&json!({
            "name": name,
            "location": location,
            "size": size,
            "crop_type": crop_type,
            "status": status,
            "soil_moisture": soil_moisture,
            "sunlight": sunlight,
            "growth_stage": growth_stage,
        })),
        Commands::SetUserStatus { id, status } => client
            .patch(format!("{}/users/{}", url, id))
            .json(&json!({ "status": status })),
        Commands::UpdateTaskStatus { id, status } => client
            .patch(format!("{}/tasks/{}", url, id))
            .json(&json!({ "status": status })),
        Commands::DeleteTask { id } => client.delete(format!("{}/tasks/{}", url, id)),
        Commands::MarkRead { id } => client.post(format!("{}/notifications/{}/read", url, id)),
        Commands::ClearNotifications { user_id } => {
            client.post(format!("{}/users/{}/notifications/clear", url, user_id))
        }
    };

    send(request).await
}

async fn send(request: RequestBuilder) -> Result<(), Box<dyn std::error::Error>> {
    let res = request.send().await?;
    let status = res.status();
    let text = res.text().await?;
    match serde_json::from_str::<Value>(&text) {
        Ok(body) => println!("{}", serde_json::to_string_pretty(&body)?),
        Err(_) => println!("Response: {}", text),
    }
    if !status.is_success() {
        return Err(format!("server answered {}", status).into());
    }
    Ok(())
}
