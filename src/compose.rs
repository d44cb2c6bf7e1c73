//! Combines the mixed audio and the display video into the stream the
//! recorder consumes.

use crate::display::DisplayHandle;
use crate::media::MediaStream;

/// `[mixed audio, display video, raw display audio?]`, or `None` until both
/// an audio and a video track exist. `None` means "not ready yet", never
/// failure.
pub fn compose(mixed: Option<&MediaStream>, display: Option<&DisplayHandle>) -> Option<MediaStream> {
    let audio = mixed?.audio_tracks().next()?;
    let display = display?;
    let video = display.video_track()?;

    let mut tracks = vec![audio.clone(), video.clone()];
    if let Some(system_audio) = display.audio_track() {
        tracks.push(system_audio.clone());
    }
    Some(MediaStream::new(tracks))
}
