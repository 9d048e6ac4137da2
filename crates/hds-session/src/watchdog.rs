//! 準備フェーズの中断ウォッチドッグ
//!
//! 準備開始時に固定期限のワンショットタイマーを登録する。延長はない。
//! 期限までに Ready にならなかったセッションは閉じられ、作り直しになる。

use tracing::{debug, warn};

use crate::collaborators::{Timer, TimerId};
use crate::error::SessionError;

#[derive(Debug)]
pub struct AbortWatchdog {
    timeout_ms: u64,
    armed: Option<TimerId>,
}

impl AbortWatchdog {
    pub fn new(timeout_ms: u64) -> Self {
        AbortWatchdog {
            timeout_ms,
            armed: None,
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// `now_ms + timeout_ms` にタイマーを登録する
    ///
    /// 前のタイマーが残っていれば先に解除する。
    ///
    /// # エラー
    /// - `SessionError::TimerUnavailable`: タイマーを登録できない
    pub fn arm<T: Timer>(&mut self, timer: &mut T, now_ms: u64) -> Result<TimerId, SessionError> {
        self.disarm(timer);
        let deadline_ms = now_ms.saturating_add(self.timeout_ms);
        let id = timer.register(deadline_ms).inspect_err(|e| {
            warn!(error = %e, "failed to start diagnostics abort timer");
        })?;
        debug!(timer = id.0, deadline_ms, "diagnostics abort timer armed");
        self.armed = Some(id);
        Ok(id)
    }

    /// タイマーを解除する
    ///
    /// # 戻り値
    /// 解除する前に登録されていたか（未登録なら何もしない）
    pub fn disarm<T: Timer>(&mut self, timer: &mut T) -> bool {
        match self.armed.take() {
            Some(id) => {
                timer.deregister(id);
                debug!(timer = id.0, "diagnostics abort timer disarmed");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// 発火したタイマーが自分のものなら登録を消して `true`
    ///
    /// 解除済み・別のタイマーの通知は `false`。
    pub fn fired(&mut self, id: TimerId) -> bool {
        if self.armed == Some(id) {
            self.armed = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeTimer {
        next: u64,
        registered: Vec<(TimerId, u64)>,
        deregistered: Vec<TimerId>,
        fail: bool,
    }

    impl Timer for FakeTimer {
        fn register(&mut self, deadline_ms: u64) -> Result<TimerId, SessionError> {
            if self.fail {
                return Err(SessionError::TimerUnavailable("no timers left".into()));
            }
            self.next += 1;
            let id = TimerId(self.next);
            self.registered.push((id, deadline_ms));
            Ok(id)
        }

        fn deregister(&mut self, id: TimerId) {
            self.deregistered.push(id);
        }
    }

    #[test]
    fn test_arm_uses_fixed_deadline() {
        let mut timer = FakeTimer::default();
        let mut dog = AbortWatchdog::new(1000);
        let id = dog.arm(&mut timer, 500).unwrap();
        assert_eq!(timer.registered, vec![(id, 1500)]);
        assert!(dog.is_armed());
    }

    #[test]
    fn test_disarm_is_noop_when_not_armed() {
        let mut timer = FakeTimer::default();
        let mut dog = AbortWatchdog::new(1000);
        assert!(!dog.disarm(&mut timer));

        let id = dog.arm(&mut timer, 0).unwrap();
        assert!(dog.disarm(&mut timer));
        assert!(!dog.disarm(&mut timer));
        assert_eq!(timer.deregistered, vec![id]);
    }

    #[test]
    fn test_rearm_deregisters_previous() {
        let mut timer = FakeTimer::default();
        let mut dog = AbortWatchdog::new(10);
        let first = dog.arm(&mut timer, 0).unwrap();
        let second = dog.arm(&mut timer, 5).unwrap();
        assert_eq!(timer.deregistered, vec![first]);
        assert!(dog.fired(second));
    }

    #[test]
    fn test_fired_ignores_stale_timer() {
        let mut timer = FakeTimer::default();
        let mut dog = AbortWatchdog::new(10);
        let id = dog.arm(&mut timer, 0).unwrap();
        assert!(!dog.fired(TimerId(id.0 + 100)));
        assert!(dog.is_armed());
        assert!(dog.fired(id));
        assert!(!dog.is_armed());
        assert!(!dog.fired(id));
    }

    #[test]
    fn test_arm_failure_leaves_disarmed() {
        let mut timer = FakeTimer {
            fail: true,
            ..FakeTimer::default()
        };
        let mut dog = AbortWatchdog::new(10);
        assert!(matches!(
            dog.arm(&mut timer, 0),
            Err(SessionError::TimerUnavailable(_))
        ));
        assert!(!dog.is_armed());
    }
}
