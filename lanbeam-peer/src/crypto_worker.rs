//! Chunk encryption and decryption off the async runtime.
//!
//! One worker per transfer runs on the blocking pool and processes jobs in
//! submission order, so outputs come back in the order chunks went in.

use bytes::Bytes;
use lanbeam_core::{ChunkCipher, CryptoError};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Encrypt,
    Decrypt,
}

#[derive(Debug)]
pub struct Job {
    pub index: u32,
    pub data: Bytes,
}

/// A processed chunk tagged with the transfer it belongs to.
#[derive(Debug)]
pub struct Output<T> {
    pub tag: T,
    pub index: u32,
    pub result: Result<Vec<u8>, CryptoError>,
}

/// Handle to a running worker. Dropping it lets the worker drain its queue
/// and exit.
pub struct CryptoWorker {
    jobs: mpsc::Sender<Job>,
}

impl CryptoWorker {
    /// At most `depth` jobs wait in the queue; `submit` blocks beyond that.
    pub fn spawn<T>(
        cipher: ChunkCipher,
        op: Op,
        tag: T,
        out: mpsc::UnboundedSender<Output<T>>,
        depth: usize,
    ) -> Self
    where
        T: Clone + Send + 'static,
    {
        let (jobs, mut rx) = mpsc::channel::<Job>(depth.max(1));
        tokio::task::spawn_blocking(move || {
            while let Some(job) = rx.blocking_recv() {
                let result = match op {
                    Op::Encrypt => cipher.encrypt_chunk(job.index, &job.data),
                    Op::Decrypt => cipher.decrypt_chunk(job.index, &job.data),
                };
                let output = Output {
                    tag: tag.clone(),
                    index: job.index,
                    result,
                };
                if out.send(output).is_err() {
                    break;
                }
            }
            debug!(event = "crypto_worker_exit", ?op, "Crypto worker stopped");
        });
        Self { jobs }
    }

    /// Queue a chunk. Fails only once the worker has exited.
    pub async fn submit(&self, index: u32, data: Bytes) -> Result<(), Bytes> {
        self.jobs
            .send(Job { index, data })
            .await
            .map_err(|e| e.0.data)
    }

    /// Sender handle for feeding the worker from another task.
    pub fn jobs(&self) -> mpsc::Sender<Job> {
        self.jobs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn encrypt_then_decrypt_in_order() {
        let (cipher, _, _) = ChunkCipher::generate();
        let (enc_tx, mut enc_rx) = mpsc::unbounded_channel();
        let enc = CryptoWorker::spawn(cipher.clone(), Op::Encrypt, "enc", enc_tx, 2);
        let (dec_tx, mut dec_rx) = mpsc::unbounded_channel();
        let dec = CryptoWorker::spawn(cipher, Op::Decrypt, 7u8, dec_tx, 2);

        let chunks: Vec<Bytes> = (0..5u8).map(|i| Bytes::from(vec![i; 100])).collect();
        let feeder = {
            let jobs = enc.jobs();
            let chunks = chunks.clone();
            tokio::spawn(async move {
                for (i, c) in chunks.into_iter().enumerate() {
                    jobs.send(Job { index: i as u32, data: c }).await.unwrap();
                }
            })
        };

        for expected in 0..5u32 {
            let out = enc_rx.recv().await.unwrap();
            assert_eq!(out.tag, "enc");
            assert_eq!(out.index, expected);
            let ct = out.result.unwrap();
            dec.submit(out.index, Bytes::from(ct)).await.unwrap();
            let plain = dec_rx.recv().await.unwrap();
            assert_eq!(plain.tag, 7);
            assert_eq!(plain.result.unwrap(), chunks[expected as usize].to_vec());
        }
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn decrypt_failure_is_reported_per_chunk() {
        let (cipher, _, _) = ChunkCipher::generate();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let w = CryptoWorker::spawn(cipher, Op::Decrypt, (), tx, 1);
        w.submit(3, Bytes::from_static(b"definitely not ciphertext"))
            .await
            .unwrap();
        let out = rx.recv().await.unwrap();
        assert_eq!(out.index, 3);
        assert_eq!(out.result.unwrap_err().chunk_index(), 3);
    }
}
