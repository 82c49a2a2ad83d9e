use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use aes::Aes256;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use tokio::io::{AsyncRead, ReadBuf};

use crate::{IV_LEN, KEY_LEN};

type Aes256Ctr = Ctr128BE<Aes256>;

/// AES-256-CTR keystream positioned at a byte offset of the object.
///
/// Encryption and decryption are the same operation.
pub struct ContentCipher {
    inner: Aes256Ctr,
}

impl ContentCipher {
    /// Creates a cipher whose keystream starts at `offset` bytes into the object.
    pub fn new(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], offset: u64) -> Self {
        let mut inner = Aes256Ctr::new(&(*key).into(), &(*iv).into());
        inner.seek(offset);
        Self { inner }
    }

    /// XORs the keystream into `buf` in place and advances the position.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
    }
}

/// Wraps a byte stream and passes everything read through a [`ContentCipher`].
pub struct CipherReader<R> {
    inner: R,
    cipher: ContentCipher,
}

impl<R> CipherReader<R> {
    pub fn new(inner: R, cipher: ContentCipher) -> Self {
        Self { inner, cipher }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CipherReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.cipher.apply(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}
