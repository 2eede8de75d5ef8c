//! Lazy iteration over every page of a query.

use std::sync::Arc;

use futures_util::stream::{self, Stream, StreamExt};
use metastore_core::{EntityMetadata, ProviderResult, QueryDescriptor, QueryPage};

use crate::traits::EntityMetadataProvider;

/// Pages of `descriptor`, fetched one at a time as the stream is polled.
///
/// Ends after the first page without a continuation token, or right after
/// yielding an error.
pub fn query_pages(
    provider: Arc<dyn EntityMetadataProvider>,
    descriptor: QueryDescriptor,
) -> impl Stream<Item = ProviderResult<QueryPage>> + Send + 'static {
    stream::unfold(Some(descriptor), move |next| {
        let provider = Arc::clone(&provider);
        async move {
            let descriptor = next?;
            match provider.query(&descriptor).await {
                Ok(page) => {
                    let following = page
                        .continuation
                        .clone()
                        .map(|token| descriptor.continue_from(Some(token)));
                    Some((Ok(page), following))
                }
                Err(e) => Some((Err(e), None)),
            }
        }
    })
}

/// Every record matching `descriptor`, following continuation tokens.
pub fn query_stream(
    provider: Arc<dyn EntityMetadataProvider>,
    descriptor: QueryDescriptor,
) -> impl Stream<Item = ProviderResult<EntityMetadata>> + Send + 'static {
    query_pages(provider, descriptor).flat_map(|page| {
        let items: Vec<ProviderResult<EntityMetadata>> = match page {
            Ok(page) => page.items.into_iter().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        };
        stream::iter(items)
    })
}
