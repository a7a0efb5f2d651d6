use crate::{Error, Result};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

const MIN_DURATION: Duration = Duration::from_millis(70);
const MAX_DURATION: Duration = Duration::from_millis(6000);
const MIN_INTER_TONE_GAP: Duration = Duration::from_millis(50);

/// Length of the pause a `,` inserts between tones
const PAUSE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfOptions {
    /// Tone length, clamped to 70ms..=6000ms
    pub duration: Duration,
    /// Pause between two tones, at least 50ms
    pub inter_tone_gap: Duration,
}

impl Default for DtmfOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(100),
            inter_tone_gap: Duration::from_millis(500),
        }
    }
}

impl DtmfOptions {
    pub(crate) fn normalized(self) -> Self {
        Self {
            duration: self.duration.clamp(MIN_DURATION, MAX_DURATION),
            inter_tone_gap: self.inter_tone_gap.max(MIN_INTER_TONE_GAP),
        }
    }
}

pub(crate) fn parse_tones(tones: &str) -> Result<Vec<char>> {
    if tones.is_empty() {
        return Err(Error::InvalidOptions("no DTMF tones given"));
    }

    tones
        .chars()
        .map(|tone| match tone.to_ascii_uppercase() {
            tone @ ('0'..='9' | 'A'..='D' | '*' | '#' | ',') => Ok(tone),
            _ => Err(Error::InvalidOptions("invalid DTMF tone")),
        })
        .collect()
}

/// Tones waiting to be sent, one at a time
#[derive(Debug)]
pub(crate) struct DtmfQueue {
    tones: VecDeque<(char, DtmfOptions)>,
    ready_at: Instant,
}

impl Default for DtmfQueue {
    fn default() -> Self {
        Self {
            tones: VecDeque::new(),
            ready_at: Instant::now(),
        }
    }
}

impl DtmfQueue {
    pub(crate) fn push(&mut self, tones: Vec<char>, options: DtmfOptions) {
        self.tones
            .extend(tones.into_iter().map(|tone| (tone, options)));
    }

    /// Wait for the next tone that is due. Pending forever while the queue is empty.
    ///
    /// Cancel safe, a tone is only removed once it is returned.
    pub(crate) async fn next(&mut self) -> (char, DtmfOptions) {
        if self.tones.is_empty() {
            return std::future::pending().await;
        }

        sleep_until(self.ready_at).await;

        let Some((tone, options)) = self.tones.pop_front() else {
            return std::future::pending().await;
        };

        let busy = if tone == ',' {
            PAUSE
        } else {
            options.duration + options.inter_tone_gap
        };

        self.ready_at = Instant::now() + busy;

        (tone, options)
    }
}

/// Body of an INFO request carrying a tone
pub(crate) fn info_body(tone: char, duration: Duration) -> String {
    format!("Signal={tone}\r\nDuration={}\r\n", duration.as_millis())
}

/// Read a tone from an `application/dtmf-relay` body
pub(crate) fn parse_info_body(body: &[u8]) -> Option<(char, Duration)> {
    let body = std::str::from_utf8(body).ok()?;

    let mut signal = None;
    let mut duration = DtmfOptions::default().duration;

    for line in body.lines() {
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };

        let value = value.trim();

        match name.trim().to_ascii_lowercase().as_str() {
            "signal" => signal = value.chars().next(),
            "duration" => {
                if let Ok(millis) = value.parse() {
                    duration = Duration::from_millis(millis);
                }
            }
            _ => {}
        }
    }

    signal
        .map(|tone| tone.to_ascii_uppercase())
        .filter(|tone| matches!(tone, '0'..='9' | 'A'..='D' | '*' | '#'))
        .map(|tone| (tone, duration))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tone_validation() {
        assert_eq!(parse_tones("12a#,*").unwrap(), vec!['1', '2', 'A', '#', ',', '*']);
        assert!(parse_tones("").is_err());
        assert!(parse_tones("12E").is_err());
    }

    #[test]
    fn options_are_clamped() {
        let options = DtmfOptions {
            duration: Duration::from_millis(10),
            inter_tone_gap: Duration::from_millis(1),
        }
        .normalized();

        assert_eq!(options.duration, Duration::from_millis(70));
        assert_eq!(options.inter_tone_gap, Duration::from_millis(50));

        let options = DtmfOptions {
            duration: Duration::from_secs(10),
            ..Default::default()
        }
        .normalized();

        assert_eq!(options.duration, Duration::from_millis(6000));
    }

    #[test]
    fn info_body_both_ways() {
        assert_eq!(info_body('5', Duration::from_millis(160)), "Signal=5\r\nDuration=160\r\n");

        assert_eq!(
            parse_info_body(b"Signal= #\r\nDuration= 250\r\n"),
            Some(('#', Duration::from_millis(250)))
        );
        assert_eq!(
            parse_info_body(b"Signal=b\r\n"),
            Some(('B', Duration::from_millis(100)))
        );
        assert_eq!(parse_info_body(b"Duration=100\r\n"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn tones_are_spaced() {
        let mut queue = DtmfQueue::default();
        queue.push(vec!['1', ',', '2'], DtmfOptions::default());

        let start = Instant::now();

        assert_eq!(queue.next().await.0, '1');
        assert_eq!(start.elapsed(), Duration::ZERO);

        assert_eq!(queue.next().await.0, ',');
        assert_eq!(start.elapsed(), Duration::from_millis(600));

        assert_eq!(queue.next().await.0, '2');
        assert_eq!(start.elapsed(), Duration::from_millis(2600));

        let idle = tokio::time::timeout(Duration::from_secs(60), queue.next()).await;
        assert!(idle.is_err());
    }
}
