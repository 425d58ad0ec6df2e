//! End-to-end keep-alive runs through the public API: store, scheduler and
//! login engine over the in-process page driver.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sessionkeeper::config::SchedulerConfig;
use sessionkeeper::driver::{DriverCall, StaticPageDriver};
use sessionkeeper::events::EventBus;
use sessionkeeper::login::{LoginRunner, LoginTiming};
use sessionkeeper::model::{
    ActionHistory, ActionStatus, Credentials, LoginStatus, NewHistory, NewSite, Site,
};
use sessionkeeper::notify::Notifier;
use sessionkeeper::policy::SchedulePolicy;
use sessionkeeper::scheduler;
use sessionkeeper::storage::Store;
use tempfile::TempDir;
use tokio::sync::Mutex;

const LOGIN_PAGE: &str = r#"<html><body>
    <div class="banner">Welcome back</div>
    <form action="/session">
        <label>E-mail <input id="login-email" type="email"></label>
        <input type="password" name="pwd">
        <input type="hidden" name="csrf" value="abc">
        <button type="submit" class="btn">Sign in</button>
    </form>
</body></html>"#;

fn timing() -> LoginTiming {
    LoginTiming {
        discovery_timeout: Duration::from_millis(50),
        discovery_interval: Duration::from_millis(10),
        success_timeout: Duration::from_millis(50),
        success_poll: Duration::from_millis(10),
        settle: Duration::ZERO,
        max_wait: Duration::from_millis(100),
    }
}

#[derive(Default)]
struct Collecting {
    seen: Mutex<Vec<ActionHistory>>,
}

#[async_trait::async_trait]
impl Notifier for Collecting {
    async fn notify(&self, _site: &Site, history: &ActionHistory) {
        self.seen.lock().await.push(history.clone());
    }
}

struct Harness {
    _dir: TempDir,
    store: Store,
    driver: StaticPageDriver,
    notes: Arc<Collecting>,
    scheduler: scheduler::Scheduler,
}

fn harness(driver: StaticPageDriver) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Store::open(&dir.path().join("keepalive.db"), EventBus::default()).unwrap();
    let notes = Arc::new(Collecting::default());
    let runner = LoginRunner::new(Arc::new(driver.clone()), timing());
    let scheduler =
        scheduler::start(store.clone(), runner, notes.clone(), &SchedulerConfig::default()).unwrap();
    Harness {
        _dir: dir,
        store,
        driver,
        notes,
        scheduler,
    }
}

fn site(custom_script: Option<&str>, paused: bool) -> NewSite {
    NewSite {
        name: "shop".into(),
        url: "https://shop.example/login".into(),
        success_url: "https://shop.example/account".into(),
        credentials: Credentials::new("dave@shop.example", "correct horse"),
        take_screenshot: false,
        paused,
        custom_script: custom_script.map(str::to_string),
        policy: SchedulePolicy::new(1440, Some(2880), Some(480), Some(1200)).unwrap(),
    }
}

async fn notified(h: &Harness, count: usize) -> Vec<ActionHistory> {
    for _ in 0..150 {
        let seen = h.notes.seen.lock().await.clone();
        if seen.len() >= count {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {count} finished attempts");
}

#[tokio::test]
async fn new_site_logs_in_at_once() {
    let driver = StaticPageDriver::new(LOGIN_PAGE)
        .with_redirect("https://shop.example/account", "https://shop.example/account/");
    let h = harness(driver);
    let created = h.store.add_site(site(None, false)).unwrap();

    let seen = notified(&h, 1).await;

    assert_eq!(seen[0].status, ActionStatus::Success);
    let journal = h.driver.journal().await;
    let filled: Vec<&str> = journal
        .iter()
        .filter_map(|call| match call {
            DriverCall::FillText { value, .. } => Some(value.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(filled, ["dave@shop.example", "correct horse"]);
    assert_eq!(journal.last(), Some(&DriverCall::Disconnect));

    let next = h.store.get_site(created.id).unwrap().next_schedule.unwrap();
    assert!(next > Utc::now() + chrono::Duration::hours(6));
}

#[tokio::test]
async fn custom_script_failure_names_the_field() {
    let script = "fillUsername()\nfillPassword()\nfillText(\"//input[@name='otp']\", '123456')\nclickSubmitButton()";
    let h = harness(StaticPageDriver::new(LOGIN_PAGE));
    let created = h.store.add_site(site(Some(script), false)).unwrap();

    let seen = notified(&h, 1).await;

    assert_eq!(seen[0].status, ActionStatus::Failed);
    assert_eq!(seen[0].failure, Some(LoginStatus::TextFieldNotFound));
    assert_eq!(
        seen[0].message.as_deref(),
        Some("XPath \"//input[@name='otp']\" not found on page.")
    );
    assert!(!h
        .driver
        .journal()
        .await
        .iter()
        .any(|call| matches!(call, DriverCall::ClickButton(_))));
}

#[tokio::test]
async fn manual_history_entry_replaces_the_pending_job() {
    let h = harness(StaticPageDriver::new(LOGIN_PAGE));
    let created = h.store.add_site(site(None, true)).unwrap();
    let resumed = h.store.set_paused(created.id, false).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.scheduler.pending().await[0].fire_at, resumed.next_schedule.unwrap());

    // Out of the policy's reach, so only the manual entry can replace it.
    let sentinel = Utc::now() + chrono::Duration::days(30);
    h.scheduler.schedule(created.id, sentinel);

    h.store
        .insert_history(created.id, NewHistory::manual(Utc::now()))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let next = h.store.get_site(created.id).unwrap().next_schedule.unwrap();
    assert!(next < sentinel);
    assert!(next > Utc::now() + chrono::Duration::hours(6));
    let pending = h.scheduler.pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].fire_at, next);
    assert!(h.notes.seen.lock().await.is_empty());
}
