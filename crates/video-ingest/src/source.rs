use crate::types::{CaptureError, Frame};

/// A reconnectable camera stream.
///
/// Implementations mirror a capture device handle: `open` (re)establishes the
/// connection, `read` yields one colour frame, `release` drops the connection.
/// Resolution and channel count are fixed once a connection is open.
pub trait FrameSource: Send {
    /// Connection string used in logs and as the routing key for frames.
    fn uri(&self) -> &str;

    fn open(&mut self) -> Result<(), CaptureError>;

    fn is_open(&self) -> bool;

    fn read(&mut self) -> Result<Frame, CaptureError>;

    fn release(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn uri(&self) -> &str {
        (**self).uri()
    }

    fn open(&mut self) -> Result<(), CaptureError> {
        (**self).open()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn read(&mut self) -> Result<Frame, CaptureError> {
        (**self).read()
    }

    fn release(&mut self) {
        (**self).release()
    }
}
