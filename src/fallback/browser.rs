//! Headless Chrome 实时抓取：从零售站点首页搜索配件号，进入详情页后一次性提取全部字段
//!
//! 浏览器在阻塞线程内创建并在闭包结束时释放，成功、失败、超时路径都不会泄漏进程。

use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, Tab};

use crate::fallback::{FetchError, LiveFetcher};
use crate::session::EntityKey;
use crate::store::LivePart;

const SEARCH_INPUT: &str = "input.js-headerNavSearch";
const PART_PAGE_MARKER: &str = "partselect.com/PS";

/// 详情页提取脚本：返回与 `LivePart` 同形的 JSON 字符串
const EXTRACT_JS: &str = r#"
(function() {
    const text = (root, sel) => {
        const el = root.querySelector(sel);
        return el ? el.textContent.trim() : null;
    };
    const meta = (sel) => {
        const el = document.querySelector(sel);
        return el ? el.getAttribute('content') : null;
    };
    const ps = text(document, "span[itemprop='productID']");
    const priceText = text(document, 'span.price.pd__price') || text(document, 'span.js-partPrice');
    const price = priceText ? parseFloat(priceText.replace(/[^0-9.]/g, '')) : null;
    const rating = meta("meta[itemprop='ratingValue']");
    const reviewCount = meta("meta[itemprop='reviewCount']");

    let partType = null;
    let applianceType = null;
    const crumbs = document.querySelector('div.js-breadcrumb-data');
    if (crumbs) {
        try {
            const items = JSON.parse(crumbs.textContent);
            if (items.length >= 2) partType = items[items.length - 2].name || null;
            const joined = items.map(i => (i.name || '').toLowerCase()).join(' ');
            if (joined.includes('refrigerator')) applianceType = 'refrigerator';
            else if (joined.includes('dishwasher')) applianceType = 'dishwasher';
        } catch (e) {}
    }

    const models = [];
    document.querySelectorAll('div.pd__crossref__list.js-dataContainer div.row').forEach(row => {
        const cols = row.querySelectorAll('div.col-6, div.col, a.col-6, a.col');
        if (cols.length >= 3) {
            models.push({
                brand: cols[0].textContent.trim(),
                model_number: cols[1].textContent.trim(),
                description: cols[2].textContent.trim()
            });
        }
    });

    const qna = [];
    document.querySelectorAll('div.qna__question.js-qnaResponse').forEach(q => {
        const question = text(q, 'div.js-searchKeys');
        if (!question) return;
        qna.push({
            ps_number: ps || '',
            question: question,
            answer: text(q, 'div.qna__ps-answer__msg div.js-searchKeys') || '',
            date: text(q, 'div.qna__question__date')
        });
    });

    const stories = [];
    document.querySelectorAll('div.repair-story').forEach(s => {
        stories.push({
            ps_number: ps || '',
            title: text(s, 'div.repair-story__title') || '',
            instruction: text(s, 'div.repair-story__instruction div.js-searchKeys') || ''
        });
    });

    const reviews = [];
    document.querySelectorAll('div.pd__cust-review__submitted-review').forEach(r => {
        const stars = r.querySelector('div.rating__stars__upper');
        let stars_value = null;
        if (stars && stars.style && stars.style.width) {
            stars_value = parseFloat(stars.style.width) / 20.0;
        }
        reviews.push({
            ps_number: ps || '',
            rating: stars_value,
            title: text(r, 'div.pd__cust-review__submitted-review__header') || '',
            review_text: text(r, 'div.js-searchKeys') || ''
        });
    });

    return JSON.stringify({
        ps_number: ps || '',
        part_name: text(document, "h1[itemprop='name']") || '',
        part_type: partType,
        manufacturer_part_number: text(document, "span[itemprop='mpn']"),
        brand: text(document, "span[itemprop='brand'] span[itemprop='name']"),
        appliance_type: applianceType,
        part_price: isNaN(price) ? null : price,
        part_description: text(document, "div[itemprop='description']"),
        average_rating: rating ? parseFloat(rating) : null,
        num_reviews: reviewCount ? parseInt(reviewCount, 10) : null,
        availability: text(document, "span[itemprop='availability']"),
        product_url: window.location.href,
        compatible_models: models,
        qna: qna,
        repair_stories: stories,
        reviews: reviews
    });
})()
"#;

/// 基于 headless_chrome 的实时抓取端
pub struct ChromeFetcher {
    base_url: String,
    timeout: Duration,
}

impl ChromeFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
        }
    }

    fn search(tab: &Tab, base_url: &str, key: &str) -> Result<(), FetchError> {
        tab.navigate_to(base_url)
            .map_err(|e| FetchError::Unavailable(format!("navigate failed: {}", e)))?;
        let input = tab
            .wait_for_element(SEARCH_INPUT)
            .map_err(|e| FetchError::Unavailable(format!("search box not found: {}", e)))?;
        input
            .click()
            .map_err(|e| FetchError::Unavailable(format!("search box click failed: {}", e)))?;
        tab.type_str(key)
            .map_err(|e| FetchError::Unavailable(format!("typing failed: {}", e)))?;
        tab.press_key("Enter")
            .map_err(|e| FetchError::Unavailable(format!("search submit failed: {}", e)))?;
        tab.wait_until_navigated()
            .map_err(|e| FetchError::Timeout(format!("search navigation: {}", e)))?;
        if !tab.get_url().contains(PART_PAGE_MARKER) {
            return Err(FetchError::NotFound(key.to_string()));
        }
        Ok(())
    }

    fn scrape(base_url: &str, key: &str, timeout: Duration) -> Result<LivePart, FetchError> {
        let browser = Browser::default()
            .map_err(|e| FetchError::Unavailable(format!("Chrome launch failed: {}", e)))?;
        let tab = browser
            .new_tab()
            .map_err(|e| FetchError::Unavailable(format!("Browser tab failed: {}", e)))?;
        tab.set_default_timeout(timeout);

        Self::search(&tab, base_url, key)?;
        tab.wait_for_element("h1[itemprop='name']")
            .map_err(|_| FetchError::NotFound(key.to_string()))?;

        let result = tab
            .evaluate(EXTRACT_JS, false)
            .map_err(|e| FetchError::Unavailable(format!("extract failed: {}", e)))?;
        let raw = result
            .value
            .as_ref()
            .and_then(|v| v.as_str())
            .ok_or_else(|| FetchError::Unavailable("extract returned no data".to_string()))?;
        let live: LivePart = serde_json::from_str(raw)
            .map_err(|e| FetchError::Unavailable(format!("extract parse failed: {}", e)))?;
        if live.part.part_name.is_empty() {
            return Err(FetchError::NotFound(key.to_string()));
        }
        Ok(live)
    }
}

#[async_trait]
impl LiveFetcher for ChromeFetcher {
    async fn fetch(&self, key: &EntityKey) -> Result<LivePart, FetchError> {
        let base_url = self.base_url.clone();
        let ps = key.as_str().to_string();
        let timeout = self.timeout;
        tracing::info!(identifier = %ps, "live fetch via headless chrome");

        let mut live = tokio::task::spawn_blocking(move || Self::scrape(&base_url, &ps, timeout))
            .await
            .map_err(|e| FetchError::Unavailable(format!("Task join: {}", e)))??;

        if live.part.ps_number.is_empty() {
            live.part.ps_number = key.to_string();
        }
        for q in &mut live.qna {
            q.ps_number = live.part.ps_number.clone();
        }
        for s in &mut live.repair_stories {
            s.ps_number = live.part.ps_number.clone();
        }
        for r in &mut live.reviews {
            r.ps_number = live.part.ps_number.clone();
        }
        Ok(live)
    }
}
