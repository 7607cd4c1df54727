use novelai_rs::*;
use std::sync::Mutex;

struct Scene {
    id: &'static str,
    prompt: &'static str,
}

const SCENES: &[Scene] = &[
    Scene { id: "tavern", prompt: "fantasy tavern interior, warm light, crowd" },
    Scene { id: "forest", prompt: "misty forest path, dawn, god rays" },
    Scene { id: "harbor", prompt: "harbor town at dusk, lanterns, boats" },
];

struct Log;

impl GenerationObserver for Log {
    fn on_result(&mut self, attempt: &AttemptInfo, result: &AttemptResult) {
        let scene = attempt.scene_id.as_deref().unwrap_or("?");
        match &result.filename_hint {
            Some(name) if result.success => {
                let path = format!("{}_{}", scene, name);
                if let Some(image) = &result.image {
                    std::fs::write(&path, image).unwrap();
                }
                println!("[{}] saved {}", scene, path);
            }
            _ => println!("[{}] failed: {:?}", scene, result.error),
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let client = NovelAiClient::new(std::env::var("NOVELAI_TOKEN")?);
    let scheduler = Scheduler::new(client);

    let items = Mutex::new(vec![
        QueueableItem::new("tavern", "Tavern", 2),
        QueueableItem::new("forest", "Forest", 0),
        QueueableItem::new("harbor", "Harbor", 1),
    ]);

    let mut progress = scheduler.subscribe();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let s = progress.borrow_and_update().clone();
            println!("{:?} {}/{} {:?}", s.status, s.completed, s.total, s.current_scene);
        }
    });

    let report = scheduler
        .run_queue_drain(
            &items,
            |item| {
                let prompt = SCENES
                    .iter()
                    .find(|s| s.id == item.id)
                    .map_or(item.name.as_str(), |s| s.prompt);
                GenerationParameters::new(prompt, DEFAULT_MODEL)
            },
            &mut Log,
        )
        .await?;

    if let RunOutcome::Failed(err) = &report.outcome {
        eprintln!("queue stopped: {}", err);
    }
    Ok(())
}
