use novelai_rs::*;

struct SaveImages;

impl GenerationObserver for SaveImages {
    fn on_progress(&mut self, attempt: &AttemptInfo, percent: u8, preview: Option<&[u8]>) {
        let marker = if preview.is_some() { " (preview)" } else { "" };
        println!("image {}: {}%{}", attempt.index + 1, percent, marker);
    }

    fn on_result(&mut self, attempt: &AttemptInfo, result: &AttemptResult) {
        match (&result.image, &result.filename_hint) {
            (Some(image), Some(name)) => {
                std::fs::write(name, image).unwrap();
                println!("image {}: saved {}", attempt.index + 1, name);
            }
            _ => println!(
                "image {}: failed: {}",
                attempt.index + 1,
                result.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let token = std::env::var("NOVELAI_TOKEN")?;
    let client = NovelAiClient::new(token);

    let sub = client.subscription().await?;
    println!("Tier: {} ({:?} Anlas)", sub.tier, sub.fixed_anlas);

    let params = GenerationParameters::new("1girl, lighthouse, stormy sea, night", DEFAULT_MODEL)
        .negative("lowres, blurry, text")
        .variety_boost(true);

    let scheduler = Scheduler::with_config(
        client,
        SchedulerConfig::builder()
            .with_cooldown(std::time::Duration::from_secs(2))
            .build(),
    );

    // Ctrl-C cancels the run; the in-flight image is discarded.
    let handle = scheduler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    let report = scheduler
        .run_batch(seeded_factory(params, false), 4, &mut SaveImages)
        .await?;
    println!(
        "{:?}: {}/{} attempts, {} saved",
        report.status(),
        report.completed,
        report.total,
        report.successes()
    );
    Ok(())
}
