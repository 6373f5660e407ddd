//! Simple pipeline example - run a small project and stream its output
//!
//! Uses `/bin/sh` as the interpreter so it works without Python installed.

use runpad_sandbox::{ExecutionCoordinator, ExecutionRequest, SandboxConfig, StreamKind};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut config = SandboxConfig::default();
    config.interpreter.program = "/bin/sh".to_string();
    config.default_entry = "main.sh".to_string();
    let coordinator = ExecutionCoordinator::new(config);

    println!("=== Runpad Pipeline Example ===\n");
    println!("Runtime: {}\n", coordinator.runtime_name());

    println!("Example 1: Project with a helper file");
    let request = ExecutionRequest::new(Vec::new())
        .with_file("main.sh", ". ./lib/greet.sh\ngreet sandbox\n")
        .with_file("lib/greet.sh", "greet() { echo \"Hello from $1!\"; }\n");
    execute_and_print(&coordinator, request).await?;

    println!("\nExample 2: Error output");
    let request = ExecutionRequest::new(Vec::new())
        .with_file("main.sh", "echo 'Error message' >&2; exit 1\n");
    execute_and_print(&coordinator, request).await?;

    println!("\nExample 3: Long running task with timeout");
    let request = ExecutionRequest::new(Vec::new())
        .with_file("main.sh", "echo working; sleep 10; echo 'Done!'\n")
        .with_timeout(Duration::from_secs(2));
    execute_and_print(&coordinator, request).await?;

    Ok(())
}

async fn execute_and_print(
    coordinator: &ExecutionCoordinator,
    request: ExecutionRequest,
) -> anyhow::Result<()> {
    let mut stream = coordinator.execute_streaming(request);
    while let Some(event) = stream.next_event().await {
        let label = match event.stream {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
            StreamKind::Install => "install",
        };
        print!("  {}: {}", label, event.text());
    }

    let result = stream.finish().await?;
    println!("\n  Result:");
    println!("    Exit code: {:?}", result.exit_code);
    println!("    Duration: {}ms", result.duration_ms);
    println!("    Timed out: {}", result.timed_out);
    if !result.warnings.is_empty() {
        println!("    Warnings: {:?}", result.warnings);
    }
    Ok(())
}
