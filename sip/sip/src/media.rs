use bytes::Bytes;
use sip_ua::media::{
    MediaError, MediaHandler, MediaHandlerFactory, MediaHandlerOptions, MediaStream, Modifiers,
    MuteOptions, RenderHint,
};
use std::sync::Arc;
use std::time::Duration;

/// Factory wrapper removing `a=imageattr` lines from every remote description
pub(crate) struct CleanImageattr {
    pub(crate) inner: Arc<dyn MediaHandlerFactory>,
}

impl MediaHandlerFactory for CleanImageattr {
    fn create(&self, options: &MediaHandlerOptions) -> Arc<dyn MediaHandler> {
        Arc::new(CleanImageattrHandler {
            inner: self.inner.create(options),
        })
    }
}

struct CleanImageattrHandler {
    inner: Arc<dyn MediaHandler>,
}

#[async_trait::async_trait]
impl MediaHandler for CleanImageattrHandler {
    async fn get_description(&self, modifiers: Modifiers) -> Result<Bytes, MediaError> {
        self.inner.get_description(modifiers).await
    }

    async fn set_description(&self, sdp: Bytes) -> Result<(), MediaError> {
        self.inner.set_description(strip_imageattr(sdp)).await
    }

    fn get_local_streams(&self) -> Vec<MediaStream> {
        self.inner.get_local_streams()
    }

    fn get_remote_streams(&self) -> Vec<MediaStream> {
        self.inner.get_remote_streams()
    }

    fn render(&self, hint: &RenderHint) {
        self.inner.render(hint)
    }

    fn mute(&self, options: MuteOptions) {
        self.inner.mute(options)
    }

    fn unmute(&self, options: MuteOptions) {
        self.inner.unmute(options)
    }

    async fn send_dtmf(&self, tone: char, duration: Duration) -> Result<(), MediaError> {
        self.inner.send_dtmf(tone, duration).await
    }

    fn close(&self) {
        self.inner.close()
    }
}

fn strip_imageattr(sdp: Bytes) -> Bytes {
    let Ok(text) = std::str::from_utf8(&sdp) else {
        return sdp;
    };

    if !text.contains("a=imageattr") {
        return sdp;
    }

    let cleaned: String = text
        .split_inclusive('\n')
        .filter(|line| !line.starts_with("a=imageattr"))
        .collect();

    Bytes::from(cleaned)
}
