//! Page and slice execution.
//!
//! A page runs the windowed data query and an independent count query over
//! the same filter. The two are not snapshot-consistent: a concurrent writer
//! committing between them can make the total disagree with the content.
//!
//! A slice fetches one probe row past the window to learn whether a next
//! slice exists and never counts.

use crate::query::{Arguments, QueryModel};
use crate::session::unit_of_work::UnitOfWork;
use crate::session::RowMapper;
use crate::{Error, Result};
use datajpa_common::{Page, PageRequest, Slice};
use tracing::debug;

fn validate(uow: &UnitOfWork, request: &PageRequest) -> Result<()> {
    request
        .validate(uow.config().max_page_size)
        .map_err(Error::InvalidQuery)
}

/// Apply the request's sort and window to `model`.
///
/// A `limit` already on the model (`findTop3By...`) caps the whole result, so
/// the window never reaches past it.
pub(crate) fn window(model: &QueryModel, request: &PageRequest, probe: u64) -> QueryModel {
    let mut data = model.clone();
    data.sort = data.sort.and(request.sort.clone());

    let offset = request.offset();
    let mut limit = request.limit() + probe;
    if let Some(top) = model.limit {
        limit = limit.min(top.saturating_sub(offset));
    }

    data.offset = (offset > 0).then_some(offset);
    data.limit = Some(limit);
    data
}

pub(crate) async fn page<T>(
    uow: &mut UnitOfWork,
    model: &QueryModel,
    count_model: &QueryModel,
    args: &Arguments,
    request: &PageRequest,
    mapper: &RowMapper<T>,
    read_only: bool,
) -> Result<Page<T>> {
    validate(uow, request)?;

    // compile both before either runs
    let data_query = uow.compiler().compile(&window(model, request, 0), args)?;
    let count_query = uow.compiler().compile(count_model, args)?;

    let content = uow.list_compiled(&data_query, mapper, read_only).await?;
    let mut total = uow.count(&count_query).await?;
    if let Some(top) = model.limit {
        total = total.min(top);
    }

    debug!(
        entity = %model.entity,
        page = request.page,
        size = request.size,
        total,
        "Page loaded"
    );
    Ok(Page::new(content, request, total))
}

pub(crate) async fn slice<T>(
    uow: &mut UnitOfWork,
    model: &QueryModel,
    args: &Arguments,
    request: &PageRequest,
    mapper: &RowMapper<T>,
    read_only: bool,
) -> Result<Slice<T>> {
    validate(uow, request)?;

    let query = uow.compiler().compile(&window(model, request, 1), args)?;
    let mut content = uow.list_compiled(&query, mapper, read_only).await?;

    let size = request.size as usize;
    let has_next = content.len() > size;
    content.truncate(size);

    debug!(
        entity = %model.entity,
        page = request.page,
        size = request.size,
        has_next,
        "Slice loaded"
    );
    Ok(Slice::new(content, request, has_next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use datajpa_common::Sort;
    use proptest::prelude::*;

    #[test]
    fn test_window_appends_request_sort() {
        let model = QueryModel::select("Member").order_by(Sort::asc("age"));
        let request = PageRequest::of_sorted(2, 10, Sort::desc("username"));

        let data = window(&model, &request, 0);
        assert_eq!(data.sort, Sort::asc("age").and(Sort::desc("username")));
        assert_eq!(data.offset, Some(20));
        assert_eq!(data.limit, Some(10));

        let probe = window(&model, &PageRequest::of(0, 10), 1);
        assert_eq!(probe.offset, None);
        assert_eq!(probe.limit, Some(11));
    }

    #[test]
    fn test_window_respects_top_limit() {
        let model = QueryModel::select("Member").limit(3);
        assert_eq!(window(&model, &PageRequest::of(0, 2), 0).limit, Some(2));
        assert_eq!(window(&model, &PageRequest::of(1, 2), 0).limit, Some(1));
        assert_eq!(window(&model, &PageRequest::of(2, 2), 0).limit, Some(0));
    }

    proptest! {
        #[test]
        fn test_window_never_exceeds_request(page in 0u32..1000, size in 1u32..200, top in proptest::option::of(0u64..500)) {
            let mut model = QueryModel::select("Member");
            model.limit = top;
            let request = PageRequest::of(page, size);

            let data = window(&model, &request, 0);
            let limit = data.limit.unwrap_or_default();
            prop_assert!(limit <= u64::from(size));
            if let Some(top) = top {
                prop_assert!(request.offset() + limit <= top.max(request.offset()));
            }
        }
    }
}
