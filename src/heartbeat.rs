/*!
 # Liveness heartbeat scheduling

 Decides when to report "alive until T" to the remote service. Reports
 go out every few hours while the on-window lasts; the scheduler always
 lands one report an hour before the window closes and a final one at
 the close itself, after which it stops.
*/

use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta};
use tracing::{info, warn};

use crate::window::RecurringWindow;
use crate::Result;

const INITIAL_DELAY: Duration = Duration::from_secs(30 * 60);
const ATTEMPT_DELAY: Duration = Duration::from_secs(5);

const CONN_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const CONN_RETRY_INTERVAL: Duration = Duration::from_secs(60);
const CONN_MAX_RETRIES: u32 = 3;

/// Time source for the scheduler. Production uses [`SystemClock`];
/// tests drive a manual clock.
#[allow(async_fn_in_trait)]
pub trait Clock {
    fn now(&self) -> DateTime<Local>;
    async fn sleep(&self, d: Duration);
}

/// The wall clock and the tokio timer.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

/// Network-reachability collaborator consulted before each report.
#[allow(async_fn_in_trait)]
pub trait Connectivity {
    fn start(&mut self);
    async fn wait_until_up(
        &mut self,
        timeout: Duration,
        retry_interval: Duration,
        max_retries: u32,
    ) -> Result<()>;
    fn stop(&mut self);
}

/// Transport used to deliver the liveness reports.
#[allow(async_fn_in_trait)]
pub trait HeartbeatClient {
    /// (Re)establish an authenticated session with the service.
    async fn connect(&mut self) -> Result<()>;
    async fn send_heartbeat(&self, valid_until: DateTime<Local>) -> Result<()>;
}

/// Scheduling state for the heartbeat loop. Once `penultimate` is set
/// the next deadline is the window end itself and the loop terminates
/// after sending it.
pub struct Heartbeat {
    valid_until: DateTime<Local>,
    window_end: Option<DateTime<Local>>,
    penultimate: bool,
    pub max_attempts: u32,
}

impl Heartbeat {
    pub fn new(window: &RecurringWindow, now: DateTime<Local>) -> Self {
        let window_end = window.has_window().then(|| window.next_end(now));
        Self {
            valid_until: now,
            window_end,
            penultimate: false,
            max_attempts: 3,
        }
    }

    /// Commits to the next report deadline. Returns the deadline and
    /// whether it is the final one before the window closes.
    pub fn advance(&mut self, now: DateTime<Local>) -> (DateTime<Local>, bool) {
        if self.penultimate {
            // penultimate is only ever set when a window end is known
            if let Some(end) = self.window_end {
                self.valid_until = end;
                return (end, true);
            }
        }

        self.valid_until = now + TimeDelta::hours(4);
        if let Some(end) = self.window_end {
            let last_regular = end - TimeDelta::hours(1);
            if self.valid_until > last_regular {
                // always want a report one hour before the end if possible
                self.valid_until = last_regular;
                if now > self.valid_until {
                    // rare case of a very short window
                    self.valid_until = end;
                    return (end, true);
                }
                self.penultimate = true;
            }
        }
        (self.valid_until, false)
    }

    /// How long to sleep after a report: wake an hour early to re-derive
    /// scheduling state when plenty of time remains, otherwise five
    /// minutes before the committed deadline.
    fn sleep_interval(&self, now: DateTime<Local>) -> Duration {
        let remaining = self.valid_until - now;
        let adjusted = if !self.penultimate && remaining >= TimeDelta::hours(2) {
            remaining - TimeDelta::hours(1)
        } else {
            remaining - TimeDelta::minutes(5)
        };
        adjusted.to_std().unwrap_or(Duration::ZERO)
    }
}

/// Runs the heartbeat loop until the final report of the window has
/// been attempted. Send failures are logged and the beat skipped; only
/// the schedule itself decides when the loop ends.
pub async fn run<K, C, T>(
    window: &RecurringWindow,
    clock: &K,
    connectivity: &mut C,
    client: &mut T,
) where
    K: Clock,
    C: Connectivity,
    T: HeartbeatClient,
{
    let mut hb = Heartbeat::new(window, clock.now());

    let mut initial_delay = INITIAL_DELAY;
    if !window.is_active(clock.now().time()) {
        initial_delay = initial_delay.max(window.until_start(clock.now().time()));
    }
    info!("sending initial heartbeat in {initial_delay:?}");
    clock.sleep(initial_delay).await;

    loop {
        let (valid_until, done) = hb.advance(clock.now());
        if let Err(err) =
            send_heartbeat(clock, connectivity, client, valid_until, hb.max_attempts).await
        {
            warn!("error sending heartbeat, skipping this beat: {err}");
        }
        if done {
            info!("sent final heartbeat of the window");
            return;
        }

        let sleep_for = hb.sleep_interval(clock.now());
        info!("heartbeat sleeping until {}", clock.now() + sleep_for);
        clock.sleep(sleep_for).await;
    }
}

/// One report attempt: reachability first, then an authenticated
/// session, then the send itself, each with its own bounded retries.
async fn send_heartbeat<K, C, T>(
    clock: &K,
    connectivity: &mut C,
    client: &mut T,
    valid_until: DateTime<Local>,
    max_attempts: u32,
) -> Result<()>
where
    K: Clock,
    C: Connectivity,
    T: HeartbeatClient,
{
    connectivity.start();
    let result = attempt_send(clock, connectivity, client, valid_until, max_attempts).await;
    connectivity.stop();
    result
}

async fn attempt_send<K, C, T>(
    clock: &K,
    connectivity: &mut C,
    client: &mut T,
    valid_until: DateTime<Local>,
    max_attempts: u32,
) -> Result<()>
where
    K: Clock,
    C: Connectivity,
    T: HeartbeatClient,
{
    if let Err(err) = connectivity
        .wait_until_up(CONN_TIMEOUT, CONN_RETRY_INTERVAL, CONN_MAX_RETRIES)
        .await
    {
        warn!("unable to get an internet connection, not reporting this heartbeat");
        return Err(err);
    }

    let mut attempt = 0;
    loop {
        match client.connect().await {
            Ok(()) => break,
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(err);
                }
                warn!("error connecting to API ({err}), trying again in {ATTEMPT_DELAY:?}");
                clock.sleep(ATTEMPT_DELAY).await;
            }
        }
    }

    let mut attempt = 0;
    loop {
        match client.send_heartbeat(valid_until).await {
            Ok(()) => {
                info!("sent heartbeat, valid until {valid_until}");
                return Ok(());
            }
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(err);
                }
                warn!("error sending heartbeat ({err}), trying again in {ATTEMPT_DELAY:?}");
                clock.sleep(ATTEMPT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use chrono::{NaiveTime, TimeZone};
    use std::sync::Mutex;

    fn start_of_day() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap()
    }

    fn window(start: (u32, u32), end: (u32, u32)) -> RecurringWindow {
        RecurringWindow::new(
            NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
        )
    }

    fn hours(h: i64) -> TimeDelta {
        TimeDelta::hours(h)
    }

    fn minutes(m: i64) -> TimeDelta {
        TimeDelta::minutes(m)
    }

    #[test]
    fn nine_hour_window_schedule() {
        let t0 = start_of_day();
        let w = window((0, 0), (9, 0));
        let mut hb = Heartbeat::new(&w, t0);
        let end = t0 + hours(9);

        // Wakes at T+30m, then an hour short of each committed deadline.
        let (d1, done) = hb.advance(t0 + minutes(30));
        assert_eq!((d1, done), (t0 + minutes(30) + hours(4), false));
        assert_eq!(hb.sleep_interval(t0 + minutes(30)), hours(3).to_std().unwrap());

        let (d2, done) = hb.advance(t0 + minutes(30) + hours(3));
        assert_eq!((d2, done), (t0 + minutes(30) + hours(7), false));

        let (d3, done) = hb.advance(t0 + minutes(30) + hours(6));
        // Clamped to an hour before the window end, penultimate committed.
        assert_eq!((d3, done), (end - hours(1), false));
        assert_eq!(
            hb.sleep_interval(t0 + minutes(30) + hours(6)),
            (hours(1) + minutes(25)).to_std().unwrap()
        );

        let (d4, done) = hb.advance(end - minutes(65));
        assert_eq!((d4, done), (end, true));
    }

    #[test]
    fn one_hour_window_goes_straight_to_final() {
        let t0 = start_of_day();
        let w = window((0, 0), (1, 0));
        let mut hb = Heartbeat::new(&w, t0);

        let (deadline, done) = hb.advance(t0 + minutes(30));
        assert_eq!(deadline, t0 + hours(1));
        assert!(done);
    }

    #[test]
    fn no_window_never_finishes() {
        let t0 = start_of_day();
        let w = RecurringWindow::always_active();
        let mut hb = Heartbeat::new(&w, t0);

        for i in 0..10 {
            let now = t0 + hours(4 * i);
            let (deadline, done) = hb.advance(now);
            assert_eq!(deadline, now + hours(4));
            assert!(!done);
        }
    }

    #[test]
    fn terminal_state_is_stable() {
        let t0 = start_of_day();
        let w = window((0, 0), (9, 0));
        let mut hb = Heartbeat::new(&w, t0);
        let end = t0 + hours(9);

        hb.advance(t0 + hours(7)); // clamps and commits penultimate
        assert_eq!(hb.advance(t0 + hours(8)), (end, true));
        // Further calls keep returning the terminal transition.
        assert_eq!(hb.advance(t0 + hours(12)), (end, true));
    }

    /// A clock that advances only when slept on.
    struct ManualClock {
        now: Mutex<DateTime<Local>>,
        sleeps: Mutex<Vec<Duration>>,
    }

    impl ManualClock {
        fn at(start: DateTime<Local>) -> Self {
            Self {
                now: Mutex::new(start),
                sleeps: Mutex::new(Vec::new()),
            }
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Local> {
            *self.now.lock().unwrap()
        }

        async fn sleep(&self, d: Duration) {
            *self.now.lock().unwrap() += d;
            self.sleeps.lock().unwrap().push(d);
        }
    }

    struct AlwaysUp;

    impl Connectivity for AlwaysUp {
        fn start(&mut self) {}

        async fn wait_until_up(&mut self, _: Duration, _: Duration, _: u32) -> Result<()> {
            Ok(())
        }

        fn stop(&mut self) {}
    }

    /// Records sent reports; fails the first `connect_failures`
    /// session attempts.
    struct RecordingClient {
        connect_failures: u32,
        connects: u32,
        sent: Mutex<Vec<DateTime<Local>>>,
    }

    impl RecordingClient {
        fn new() -> Self {
            Self {
                connect_failures: 0,
                connects: 0,
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<DateTime<Local>> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl HeartbeatClient for RecordingClient {
        async fn connect(&mut self) -> Result<()> {
            self.connects += 1;
            if self.connects <= self.connect_failures {
                return Err(Error::Api("no session".into()));
            }
            Ok(())
        }

        async fn send_heartbeat(&self, valid_until: DateTime<Local>) -> Result<()> {
            self.sent.lock().unwrap().push(valid_until);
            Ok(())
        }
    }

    #[tokio::test]
    async fn loop_covers_nine_hour_window() {
        let t0 = start_of_day();
        let clock = ManualClock::at(t0);
        let w = window((0, 0), (9, 0));
        let mut client = RecordingClient::new();

        run(&w, &clock, &mut AlwaysUp, &mut client).await;

        let end = t0 + hours(9);
        assert_eq!(
            client.sent(),
            vec![
                t0 + minutes(30) + hours(4),
                t0 + minutes(30) + hours(7),
                end - hours(1),
                end,
            ]
        );
        let sleeps = clock.sleeps.lock().unwrap().clone();
        assert_eq!(
            sleeps,
            vec![
                Duration::from_secs(30 * 60),
                Duration::from_secs(3 * 3600),
                Duration::from_secs(3 * 3600),
                Duration::from_secs(85 * 60),
            ]
        );
    }

    #[tokio::test]
    async fn loop_waits_for_window_start() {
        // Window opens an hour in: the initial delay stretches to match.
        let t0 = start_of_day();
        let clock = ManualClock::at(t0);
        let w = window((1, 0), (4, 0));
        let mut client = RecordingClient::new();

        run(&w, &clock, &mut AlwaysUp, &mut client).await;

        let end = t0 + hours(4);
        assert_eq!(client.sent(), vec![end - hours(1), end]);
        let sleeps = clock.sleeps.lock().unwrap().clone();
        assert_eq!(
            sleeps,
            vec![
                Duration::from_secs(3600),
                Duration::from_secs(115 * 60),
            ]
        );
    }

    #[tokio::test]
    async fn session_retries_are_bounded() {
        let t0 = start_of_day();
        let clock = ManualClock::at(t0);
        let w = window((0, 0), (1, 0));
        let mut client = RecordingClient::new();
        client.connect_failures = 2;

        run(&w, &clock, &mut AlwaysUp, &mut client).await;

        // Two failed session attempts, then success on the third.
        assert_eq!(client.connects, 3);
        assert_eq!(client.sent(), vec![t0 + hours(1)]);
    }
}
