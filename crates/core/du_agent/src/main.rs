use clap::Parser;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let agent_opt = du_agent::AgentOpt::parse();
    du_agent::run(agent_opt).await
}
